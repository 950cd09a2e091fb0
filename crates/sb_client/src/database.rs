//! Per-database replica engine.
//!
//! A [`Database`] is a deterministic fold over the server's ordered
//! transaction log: a snapshot ("bundle") replaces the whole state, then
//! every log entry past the snapshot's sequence number replays on top. The
//! client never mutates this state directly; its own writes round-trip
//! through the server and come back as log entries, so every device folds
//! the identical sequence.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use sb_crypto::{aead, hash, SymmetricKey};
use sb_proto::bundle::{self, BundlePlaintext, IndexEntry, ItemState};
use sb_proto::event::ApplyTransactionsEvent;
use sb_proto::transaction::Operation;

use crate::error::ClientError;

/// One visible item, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub item_id: String,
    pub record: Value,
}

/// Invoked with the full item list after every applied server message.
pub type ChangeHandler = Arc<dyn Fn(Vec<Item>) + Send + Sync>;

pub struct Database {
    db_name: String,
    db_name_hash: String,
    db_id: Option<String>,
    db_key: Option<SymmetricKey>,
    items: HashMap<String, ItemState>,
    items_index: Vec<IndexEntry>,
    last_seq_no: u64,
    init: bool,
    on_change: ChangeHandler,
}

impl Database {
    pub(crate) fn new(db_name: String, db_name_hash: String, on_change: ChangeHandler) -> Self {
        Self {
            db_name,
            db_name_hash,
            db_id: None,
            db_key: None,
            items: HashMap::new(),
            items_index: Vec::new(),
            last_seq_no: 0,
            init: false,
            on_change,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn db_name_hash(&self) -> &str {
        &self.db_name_hash
    }

    pub(crate) fn db_id(&self) -> Option<&str> {
        self.db_id.as_deref()
    }

    pub(crate) fn db_key(&self) -> Option<&SymmetricKey> {
        self.db_key.as_ref()
    }

    pub(crate) fn is_init(&self) -> bool {
        self.init
    }

    pub(crate) fn set_on_change(&mut self, on_change: ChangeHandler) {
        self.on_change = on_change;
    }

    /// Items in insertion order (the order of each id's first Insert).
    pub fn get_items(&self) -> Vec<Item> {
        self.items_index
            .iter()
            .filter_map(|entry| {
                self.items.get(&entry.item_id).map(|state| Item {
                    item_id: entry.item_id.clone(),
                    record: state.record.clone(),
                })
            })
            .collect()
    }

    /// Fold one `ApplyTransactions` push into the replica, then notify the
    /// subscriber once.
    ///
    /// Decryption failures here (database key unwrap, bundle, sealed ops)
    /// are fatal to the connection: they mean the log is not ours.
    pub(crate) fn apply_message(
        &mut self,
        encryption_key: &SymmetricKey,
        event: &ApplyTransactionsEvent,
    ) -> Result<(), ClientError> {
        if self.db_key.is_none() {
            let wrapped = event.db_key.as_ref().ok_or_else(|| {
                ClientError::DatabaseNotOpen(format!(
                    "first push for {} carried no database key",
                    self.db_name
                ))
            })?;
            self.db_key = Some(aead::unwrap_key(encryption_key, wrapped)?);
        }
        if self.db_id.is_none() {
            self.db_id = Some(event.db_id.clone());
        }
        let db_key = self.db_key.clone().expect("set above");

        if let Some(wire) = &event.bundle {
            let snapshot = bundle::open_bundle(&db_key, wire)?;
            let bundle_seq_no = event.bundle_seq_no.unwrap_or(0);
            debug!(
                db = %self.db_name_hash,
                seq_no = bundle_seq_no,
                items = snapshot.items.len(),
                "applying bundle snapshot"
            );
            self.items = snapshot.items;
            self.items_index = snapshot.items_index;
            self.last_seq_no = bundle_seq_no;
        }

        // The server sends the log ordered, but ordering is our invariant,
        // not its promise.
        let mut log: Vec<_> = event.transaction_log.iter().collect();
        log.sort_by_key(|t| t.seq_no);

        for wire_tx in log {
            if wire_tx.seq_no <= self.last_seq_no {
                debug!(seq_no = wire_tx.seq_no, last = self.last_seq_no, "skipping replayed transaction");
                continue;
            }
            let tx = wire_tx.unseal(&db_key)?;
            for op in tx.operations {
                self.apply_operation(op, tx.seq_no);
            }
            self.last_seq_no = tx.seq_no;
        }

        self.init = true;
        (self.on_change)(self.get_items());
        Ok(())
    }

    fn apply_operation(&mut self, op: Operation, seq_no: u64) {
        match op {
            Operation::Insert { item_id, record } => {
                if self.items.contains_key(&item_id) {
                    warn!(%item_id, seq_no, "insert for existing item ignored");
                    return;
                }
                self.items_index.push(IndexEntry { item_id: item_id.clone(), seq_no });
                self.items.insert(item_id, ItemState { record, seq_no });
            }
            Operation::Update { item_id, record } => {
                match self.items.get_mut(&item_id) {
                    Some(state) => {
                        state.record = record;
                        state.seq_no = seq_no;
                    }
                    None => warn!(%item_id, seq_no, "update for unknown item ignored"),
                }
            }
            Operation::Delete { item_id } => {
                self.items.remove(&item_id);
                self.items_index.retain(|entry| entry.item_id != item_id);
            }
        }
    }

    /// Snapshot the replica for the server: the sealed bundle plus one HMAC
    /// item key per index entry (the server garbage-collects superseded
    /// transactions by item).
    pub(crate) fn build_bundle(
        &self,
        hmac_key: &SymmetricKey,
    ) -> Result<(u64, String, Vec<String>), ClientError> {
        let db_key = self
            .db_key
            .as_ref()
            .ok_or_else(|| ClientError::DatabaseNotOpen(self.db_name.clone()))?;
        let snapshot = BundlePlaintext {
            items: self.items.clone(),
            items_index: self.items_index.clone(),
        };
        let sealed = bundle::seal_bundle(db_key, &snapshot)?;
        let keys = self
            .items_index
            .iter()
            .map(|entry| hash::hmac_hex(hmac_key, entry.item_id.as_bytes()))
            .collect();
        Ok((self.last_seq_no, sealed, keys))
    }
}
