//! SHA-256 / HMAC-SHA256 utilities.
//!
//! HMAC tags are what the server indexes by: database names and item ids
//! never leave the device in plaintext, but equal inputs produce equal tags,
//! which is exactly the lookup property the server needs.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::SymmetricKey;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256 tag over `data`.
pub fn hmac_sign(key: &SymmetricKey, data: &[u8]) -> [u8; 32] {
    // HMAC-SHA256 accepts any key length; 32 bytes never fails.
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts 32-byte keys");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Hex form of an HMAC tag, the wire representation of `dbNameHash` and
/// `itemKey` fields.
pub fn hmac_hex(key: &SymmetricKey, data: &[u8]) -> String {
    hex::encode(hmac_sign(key, data))
}

/// Human-readable fingerprint of a public key: SHA-256, truncated to
/// 20 bytes, hex-encoded in groups of 4 for display.
///
/// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = sha256(public_key);
    let hex = hex::encode(&digest[..20]);
    hex.chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}
