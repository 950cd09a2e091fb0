//! X25519 key agreement.
//!
//! Two uses in this protocol:
//! - Peer-to-peer: seed handoff between a user's devices and database-key
//!   grants between users. Both sides derive `DH(private, peer_public)` and
//!   feed it through HKDF to get an AES-256-GCM key.
//! - Client-to-server: proving possession of the seed-derived DH key by
//!   decrypting the server's validation message under
//!   `DH(private, SERVER_PUBLIC_KEY)`.
//!
//! References:
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{error::CryptoError, SymmetricKey};

/// Compiled-in X25519 public key of the deployment's server.
/// REPLACE_ME: regenerate per deployment; must match the server's scalar.
pub const SERVER_PUBLIC_KEY: [u8; 32] = [
    0x2f, 0xe5, 0x7d, 0xa3, 0x47, 0xcd, 0x62, 0x43, 0x15, 0x28, 0xda, 0xac,
    0x5f, 0xbb, 0x29, 0x07, 0x30, 0xff, 0xf6, 0x84, 0xaf, 0xc4, 0xcf, 0xc2,
    0xed, 0x90, 0x99, 0x5f, 0x58, 0xcb, 0x3b, 0x74,
];

const SHARED_KEY_SALT: &[u8] = b"sealbase-dh-v1";
const SHARED_KEY_INFO: &[u8] = b"aes-256-gcm";

/// X25519 private scalar. The inner `StaticSecret` zeroizes on drop.
pub struct DhPrivateKey(StaticSecret);

impl DhPrivateKey {
    /// Fresh random keypair (seed requests, tests).
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild from raw scalar bytes (HKDF output or persisted seed-request
    /// key). Clamping happens inside `StaticSecret`.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("DH key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(arr))
    }

    /// Raw scalar bytes, for persisting an ephemeral seed-request key.
    /// Never expose a seed-derived key this way.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        X25519Public::from(&self.0).to_bytes()
    }

    /// AES key shared with a peer: X25519 followed by HKDF-SHA256.
    pub fn shared_key(&self, peer_public: &[u8]) -> Result<SymmetricKey, CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("peer public key must be 32 bytes, got {}", peer_public.len())))?;
        let shared = self.0.diffie_hellman(&X25519Public::from(peer));

        let hk = Hkdf::<Sha256>::new(Some(SHARED_KEY_SALT), shared.as_bytes());
        let mut out = [0u8; 32];
        hk.expand(SHARED_KEY_INFO, &mut out)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(SymmetricKey::from_bytes(out))
    }

    /// AES key shared with the deployment server.
    pub fn shared_key_with_server(&self) -> Result<SymmetricKey, CryptoError> {
        self.shared_key(&SERVER_PUBLIC_KEY)
    }
}

impl std::fmt::Debug for DhPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DhPrivateKey(..)")
    }
}
