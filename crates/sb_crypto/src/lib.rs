//! sb_crypto — Sealbase cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key bytes live inside opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `aead`  — AES-256-GCM encrypt/decrypt helpers (random nonce prepended)
//! - `kdf`   — HKDF-SHA256 subkey derivation from the account seed
//! - `hash`  — SHA-256 / HMAC-SHA256 utilities + display fingerprints
//! - `dh`    — X25519 key agreement with peers and with the server
//! - `error` — unified error type

pub mod aead;
pub mod dh;
pub mod error;
pub mod hash;
pub mod kdf;

pub use error::CryptoError;

use rand::RngCore;
use zeroize::ZeroizeOnDrop;

/// 32-byte symmetric key (AES-256-GCM or HMAC-SHA256). Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Accepts any 32-byte slice; anything else is invalid key material.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fresh random key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}
