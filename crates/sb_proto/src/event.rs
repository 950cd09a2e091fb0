//! Inbound messages: correlated responses and server-pushed events.
//!
//! The router is a closed sum: every route the server can push has an
//! explicit variant. Anything else parses to [`InboundMessage::Unknown`]
//! and is logged and discarded by the connection, never an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::transaction::WireTransaction;

/// Status code the server uses for success.
pub const STATUS_OK: u16 = 200;

/// `{requestId, response: {status, data?, message?}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    pub response: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseBody {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Per-user HKDF salts, delivered once per connection. Base64 on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Salts {
    pub encryption_key_salt: String,
    pub dh_key_salt: String,
    pub hmac_key_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub salts: Salts,
    /// AES-GCM ciphertext (base64) of a nonce the server knows, under the
    /// client-server DH shared key. Echoing the plaintext back proves key
    /// possession.
    pub encrypted_validation_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyTransactionsEvent {
    pub db_id: String,
    /// Present only on the first push for a database this connection opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name_hash: Option<String>,
    /// Database key wrapped under the user's encryption key; present when
    /// `db_name_hash` is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_seq_no: Option<u64>,
    #[serde(default)]
    pub transaction_log: Vec<WireTransaction>,
}

/// Server-pushed events, dispatched on the `route` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "route")]
pub enum ServerEvent {
    Connection(ConnectionEvent),
    ApplyTransactions(ApplyTransactionsEvent),
    #[serde(rename_all = "camelCase")]
    BuildBundle { db_id: String },
    #[serde(rename_all = "camelCase")]
    ReceiveRequestForSeed { requester_public_key: String },
    #[serde(rename_all = "camelCase")]
    ReceiveSeed {
        encrypted_seed: String,
        sender_public_key: String,
    },
}

/// One parsed inbound frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(Response),
    Event(ServerEvent),
    /// Unroutable frame; carried route name (if any) for the log line.
    Unknown { route: Option<String> },
}

impl InboundMessage {
    /// Classify a raw text frame. Frames with a `route` we do not know, or
    /// with neither `route` nor `requestId`, are `Unknown`; only frames that
    /// are not JSON at all are an error.
    pub fn parse(raw: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(raw)?;

        if value.get("route").is_some() {
            let route = value["route"].as_str().map(str::to_owned);
            return match serde_json::from_value::<ServerEvent>(value) {
                Ok(event) => Ok(Self::Event(event)),
                Err(_) => Ok(Self::Unknown { route }),
            };
        }

        if value.get("requestId").is_some() {
            return match serde_json::from_value::<Response>(value) {
                Ok(resp) => Ok(Self::Response(resp)),
                Err(_) => Ok(Self::Unknown { route: None }),
            };
        }

        Ok(Self::Unknown { route: None })
    }
}
