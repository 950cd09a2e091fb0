use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] sb_crypto::CryptoError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),
}
