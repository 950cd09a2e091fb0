//! Database snapshot ("bundle") payload.
//!
//! Wire form: base64( AES-GCM( DEFLATE( JSON {items, itemsIndex} ), dbKey ) ).
//!
//! A bundle replaces the replica's state wholesale; the transaction log then
//! replays everything past `bundleSeqNo`. Compression happens before
//! encryption; ciphertext does not compress.

use std::collections::HashMap;
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sb_crypto::{aead, SymmetricKey};

use crate::error::ProtoError;

/// One stored item: the decrypted record plus the seq number that last
/// touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub record: Value,
    pub seq_no: u64,
}

/// One slot of the insertion-order index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub item_id: String,
    pub seq_no: u64,
}

/// The snapshot plaintext: items keyed by id, plus their first-insert order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BundlePlaintext {
    pub items: HashMap<String, ItemState>,
    pub items_index: Vec<IndexEntry>,
}

fn compress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Serialise, compress, encrypt, and base64-encode a snapshot.
pub fn seal_bundle(db_key: &SymmetricKey, bundle: &BundlePlaintext) -> Result<String, ProtoError> {
    let json = serde_json::to_vec(bundle)?;
    let compressed = compress(&json)?;
    let ciphertext = aead::encrypt(db_key, &compressed)?;
    Ok(STANDARD.encode(ciphertext))
}

/// Inverse of [`seal_bundle`]. An authentication failure here means the
/// bundle was not produced under this database key and is fatal to the
/// caller's connection.
pub fn open_bundle(db_key: &SymmetricKey, wire: &str) -> Result<BundlePlaintext, ProtoError> {
    let ciphertext = STANDARD.decode(wire)?;
    let compressed = aead::decrypt(db_key, &ciphertext)?;
    let json = decompress(&compressed)?;
    Ok(serde_json::from_slice(&json)?)
}
