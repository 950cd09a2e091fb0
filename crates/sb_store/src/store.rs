//! SQLite-backed key/value store, one row per (username, slot).

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::StoreError;

const SLOT_SEED: &str = "seed";
const SLOT_SEED_REQUEST: &str = "seed_request";
const SLOT_SESSION: &str = "session";

/// Central store handle. Cheap to clone (the pool is an Arc internally).
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode is configured at connection time, not inside a
    /// migration: SQLite forbids changing `journal_mode` inside a
    /// transaction and sqlx wraps every migration in one.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn get(&self, username: &str, slot: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM device_state WHERE username = ? AND slot = ?")
                .bind(username)
                .bind(slot)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, username: &str, slot: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device_state (username, slot, value, updated_at) \
             VALUES (?, ?, ?, datetime('now')) \
             ON CONFLICT (username, slot) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(username)
        .bind(slot)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, username: &str, slot: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM device_state WHERE username = ? AND slot = ?")
            .bind(username)
            .bind(slot)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Seed ─────────────────────────────────────────────────────────────────

    pub async fn get_seed(&self, username: &str) -> Result<Option<Zeroizing<String>>, StoreError> {
        Ok(self.get(username, SLOT_SEED).await?.map(Zeroizing::new))
    }

    pub async fn save_seed(&self, username: &str, seed_b64: &str) -> Result<(), StoreError> {
        debug!(username, "saving seed to device store");
        self.put(username, SLOT_SEED, seed_b64).await
    }

    // ── Seed request keypair ─────────────────────────────────────────────────

    pub async fn get_seed_request(&self, username: &str) -> Result<Option<Zeroizing<String>>, StoreError> {
        Ok(self.get(username, SLOT_SEED_REQUEST).await?.map(Zeroizing::new))
    }

    pub async fn set_seed_request(&self, username: &str, blob: &str) -> Result<(), StoreError> {
        self.put(username, SLOT_SEED_REQUEST, blob).await
    }

    pub async fn remove_seed_request(&self, username: &str) -> Result<(), StoreError> {
        self.remove(username, SLOT_SEED_REQUEST).await
    }

    // ── Session ──────────────────────────────────────────────────────────────

    pub async fn get_session(&self, username: &str) -> Result<Option<String>, StoreError> {
        self.get(username, SLOT_SESSION).await
    }

    pub async fn save_session(&self, username: &str, session_id: &str) -> Result<(), StoreError> {
        self.put(username, SLOT_SESSION, session_id).await
    }

    /// Clear per-session artifacts (session id and any in-flight seed
    /// request). Called before the SignOut request goes out, so a network
    /// failure cannot leave the device signed in locally. The seed itself
    /// survives sign-out.
    pub async fn sign_out_session(&self, username: &str) -> Result<(), StoreError> {
        debug!(username, "clearing session artifacts");
        self.remove(username, SLOT_SESSION).await?;
        self.remove(username, SLOT_SEED_REQUEST).await?;
        Ok(())
    }
}
