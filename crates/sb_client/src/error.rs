use sb_proto::Action;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    Disconnected,

    #[error("A connection is already live for this client")]
    AlreadyConnected,

    #[error("Server rejected key validation")]
    KeyValidationFailed,

    #[error("{action} failed with status {status}: {message}")]
    RequestFailed {
        action: Action,
        status: u16,
        message: String,
    },

    #[error("User dismissed the seed prompt")]
    Canceled,

    #[error("No seed available for this user")]
    MissingSeed,

    #[error("Salts have not arrived from the server")]
    MissingSalts,

    #[error("Database is not open: {0}")]
    DatabaseNotOpen(String),

    #[error("Invalid server endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] sb_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] sb_proto::ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] sb_store::StoreError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
