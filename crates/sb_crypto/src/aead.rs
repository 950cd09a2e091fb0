//! Authenticated encryption
//!
//! Uses AES-256-GCM.  Key size: 32 bytes.  Nonce: 12 bytes (random).
//! Tag: 16 bytes.  No associated data: every field this protocol encrypts
//! is self-contained JSON or raw key bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (12 bytes) | ciphertext + tag ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::{error::CryptoError, SymmetricKey};

const NONCE_LEN: usize = 12;

/// Encrypt `plaintext`, prepending a random 12-byte nonce.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
///
/// A tag mismatch surfaces as [`CryptoError::AeadDecrypt`]; callers decide
/// whether that is fatal or isolated.
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, ct)
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypt a UTF-8 string, returning the ciphertext base64-encoded for a
/// JSON wire field.
pub fn encrypt_string(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    let ct = encrypt(key, plaintext.as_bytes())?;
    Ok(STANDARD.encode(ct))
}

/// Decrypt a base64 wire field back to a UTF-8 string.
pub fn decrypt_string(key: &SymmetricKey, b64: &str) -> Result<String, CryptoError> {
    let ct = STANDARD.decode(b64)?;
    let pt = decrypt(key, &ct)?;
    String::from_utf8(pt.to_vec()).map_err(|_| CryptoError::InvalidPlaintext)
}

/// Wrap a 32-byte key under another key (key transport).
/// Plaintext is the base64 form of the raw key, matching the wire contract
/// for `encryptedDbKey` / `encryptedAccessKey` / `encryptedSeed` fields.
pub fn wrap_key(wrapping_key: &SymmetricKey, key_to_wrap: &SymmetricKey) -> Result<String, CryptoError> {
    encrypt_string(wrapping_key, &STANDARD.encode(key_to_wrap.as_bytes()))
}

/// Unwrap a key wrapped with [`wrap_key`].
pub fn unwrap_key(wrapping_key: &SymmetricKey, wrapped_b64: &str) -> Result<SymmetricKey, CryptoError> {
    let inner_b64 = decrypt_string(wrapping_key, wrapped_b64)?;
    let raw = Zeroizing::new(STANDARD.decode(inner_b64.as_bytes())?);
    SymmetricKey::from_slice(&raw)
}
