//! Transaction-log entries.
//!
//! The server orders and stores transactions but cannot read them. Each
//! entry carries:
//!   - `seqNo`    — the server-assigned position in the database's log
//!   - `itemKey`  — HMAC(hmac_key, item id), the server's opaque index
//!   - `sealedOp` — AES-GCM ciphertext (under the database key, base64) of
//!                  the JSON `{itemId, record?}` the operation applies to
//!
//! `BatchTransaction` entries carry an ordered operation list instead of a
//! single sealed op; the whole batch shares one `seqNo`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sb_crypto::{aead, SymmetricKey};

use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    BatchTransaction,
}

/// One log entry as the server relays it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub seq_no: u64,
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_op: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<WireOperation>,
}

/// One sealed operation inside a batch (or a mutation request body).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    pub command: CommandKind,
    pub item_key: String,
    pub sealed_op: String,
}

/// Plaintext carried inside a sealed op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedOp {
    item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record: Option<Value>,
}

/// A decrypted, engine-level operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert { item_id: String, record: Value },
    Update { item_id: String, record: Value },
    Delete { item_id: String },
}

impl Operation {
    pub fn item_id(&self) -> &str {
        match self {
            Operation::Insert { item_id, .. }
            | Operation::Update { item_id, .. }
            | Operation::Delete { item_id } => item_id,
        }
    }

    pub fn command(&self) -> CommandKind {
        match self {
            Operation::Insert { .. } => CommandKind::Insert,
            Operation::Update { .. } => CommandKind::Update,
            Operation::Delete { .. } => CommandKind::Delete,
        }
    }

    /// Encrypt this operation under the database key for transmission.
    pub fn seal(&self, db_key: &SymmetricKey) -> Result<String, ProtoError> {
        let (item_id, record) = match self {
            Operation::Insert { item_id, record } | Operation::Update { item_id, record } => {
                (item_id.clone(), Some(record.clone()))
            }
            Operation::Delete { item_id } => (item_id.clone(), None),
        };
        let plaintext = serde_json::to_string(&SealedOp { item_id, record })?;
        Ok(aead::encrypt_string(db_key, &plaintext)?)
    }

    fn unseal(db_key: &SymmetricKey, command: CommandKind, sealed: &str) -> Result<Self, ProtoError> {
        let plaintext = aead::decrypt_string(db_key, sealed)?;
        let op: SealedOp = serde_json::from_str(&plaintext)?;
        match (command, op.record) {
            (CommandKind::Insert, Some(record)) => Ok(Operation::Insert { item_id: op.item_id, record }),
            (CommandKind::Update, Some(record)) => Ok(Operation::Update { item_id: op.item_id, record }),
            (CommandKind::Delete, _) => Ok(Operation::Delete { item_id: op.item_id }),
            (cmd, None) => Err(ProtoError::MalformedTransaction(format!(
                "{cmd:?} op for item is missing its record"
            ))),
            (CommandKind::BatchTransaction, _) => Err(ProtoError::MalformedTransaction(
                "nested batch transactions are not allowed".into(),
            )),
        }
    }
}

/// A decrypted log entry: one seq number, one or more operations.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub seq_no: u64,
    pub operations: Vec<Operation>,
}

impl WireTransaction {
    /// Decrypt this entry's sealed ops with the database key.
    pub fn unseal(&self, db_key: &SymmetricKey) -> Result<Transaction, ProtoError> {
        let operations = match self.command {
            CommandKind::BatchTransaction => self
                .operations
                .iter()
                .map(|op| Operation::unseal(db_key, op.command, &op.sealed_op))
                .collect::<Result<Vec<_>, _>>()?,
            command => {
                let sealed = self.sealed_op.as_deref().ok_or_else(|| {
                    ProtoError::MalformedTransaction(format!("{command:?} entry has no sealed op"))
                })?;
                vec![Operation::unseal(db_key, command, sealed)?]
            }
        };
        Ok(Transaction { seq_no: self.seq_no, operations })
    }
}
