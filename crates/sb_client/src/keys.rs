//! The seed-derived key set.
//!
//! Keys exist only between a successful `ValidateKey` and connection close;
//! dropping [`DerivedKeys`] zeroizes every component.

use base64::{engine::general_purpose::STANDARD, Engine};
use sb_crypto::{dh::DhPrivateKey, kdf, SymmetricKey};
use sb_proto::event::Salts;

use crate::error::ClientError;

/// Per-user HKDF salts, decoded from their wire (base64) form.
pub struct DecodedSalts {
    pub encryption_key_salt: Vec<u8>,
    pub dh_key_salt: Vec<u8>,
    pub hmac_key_salt: Vec<u8>,
}

impl DecodedSalts {
    pub fn from_wire(salts: &Salts) -> Result<Self, ClientError> {
        Ok(Self {
            encryption_key_salt: STANDARD.decode(&salts.encryption_key_salt)?,
            dh_key_salt: STANDARD.decode(&salts.dh_key_salt)?,
            hmac_key_salt: STANDARD.decode(&salts.hmac_key_salt)?,
        })
    }
}

/// The three keys every signed-in device derives from the seed.
pub struct DerivedKeys {
    /// Wraps per-database keys for server-side storage.
    pub encryption_key: SymmetricKey,
    /// Peer and server key agreement.
    pub dh_private_key: DhPrivateKey,
    /// Deterministic hashing of database names and item ids.
    pub hmac_key: SymmetricKey,
}

impl DerivedKeys {
    pub fn derive(seed: &[u8], salts: &DecodedSalts) -> Result<Self, ClientError> {
        Ok(Self {
            encryption_key: kdf::derive_encryption_key(seed, &salts.encryption_key_salt)?,
            dh_private_key: kdf::derive_dh_private_key(seed, &salts.dh_key_salt)?,
            hmac_key: kdf::derive_hmac_key(seed, &salts.hmac_key_salt)?,
        })
    }
}
