//! Key derivation from the account seed.
//!
//! Every user key is an HKDF-SHA256 derivation of the same root seed,
//! separated by a server-stored salt and a fixed purpose string:
//!
//!   encryption_key = HKDF(seed, encryption_key_salt, "encryption")
//!   dh_private_key = HKDF(seed, dh_key_salt,         "diffie-hellman")
//!   hmac_key       = HKDF(seed, hmac_key_salt,       "hmac")
//!
//! The derivation is deterministic: any device holding the seed and the
//! per-user salts reconstructs the identical key set.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{dh::DhPrivateKey, error::CryptoError, SymmetricKey};

/// Purpose strings. These are wire-compatibility constants; changing one
/// invalidates every key the account has ever derived.
pub const ENCRYPTION_KEY_PURPOSE: &[u8] = b"encryption";
pub const DH_KEY_PURPOSE: &[u8] = b"diffie-hellman";
pub const HMAC_KEY_PURPOSE: &[u8] = b"hmac";

/// Minimum tolerated seed length. The server issues 32-byte seeds; manual
/// entry of anything shorter is rejected before key derivation.
pub const MIN_SEED_LEN: usize = 32;

/// Expand `seed` + `salt` + `purpose` into 32 bytes of key material.
pub fn derive_subkey_bytes(seed: &[u8], salt: &[u8], purpose: &[u8]) -> Result<[u8; 32], CryptoError> {
    if seed.len() < MIN_SEED_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "seed must be at least {MIN_SEED_LEN} bytes, got {}",
            seed.len()
        )));
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), seed);
    let mut out = [0u8; 32];
    hk.expand(purpose, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

/// Derive the symmetric key that wraps per-database keys.
pub fn derive_encryption_key(seed: &[u8], salt: &[u8]) -> Result<SymmetricKey, CryptoError> {
    Ok(SymmetricKey::from_bytes(derive_subkey_bytes(seed, salt, ENCRYPTION_KEY_PURPOSE)?))
}

/// Derive the X25519 scalar used for peer and server key agreement.
pub fn derive_dh_private_key(seed: &[u8], salt: &[u8]) -> Result<DhPrivateKey, CryptoError> {
    Ok(DhPrivateKey::from_bytes(derive_subkey_bytes(seed, salt, DH_KEY_PURPOSE)?))
}

/// Derive the HMAC key that hashes database names and item ids.
pub fn derive_hmac_key(seed: &[u8], salt: &[u8]) -> Result<SymmetricKey, CryptoError> {
    Ok(SymmetricKey::from_bytes(derive_subkey_bytes(seed, salt, HMAC_KEY_PURPOSE)?))
}
