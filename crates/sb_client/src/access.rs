//! Access control: database grants between users and seed handoff between
//! a user's devices.
//!
//! Both flows move a key to a peer under a pairwise X25519 shared secret,
//! and both gate on an out-of-band fingerprint check through the injected
//! UI: the server relays public keys and could substitute its own, so the
//! humans compare fingerprints before any secret flows.
//!
//! Per-grant and per-seed-request failures are isolated: one bad entry is
//! logged and iteration continues.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, info, warn};

use sb_crypto::{aead, hash};
use sb_proto::action::{
    AcceptDatabaseAccessParams, DatabaseAccessGrant, DatabaseAccessGrantList,
    GetPublicKeyParams, GrantDatabaseAccessParams, NoParams, SendSeedParams, UserPublicKey,
};
use sb_proto::Action;

use crate::connection::{Connection, ConnectionInner};
use crate::error::ClientError;

/// Host-supplied interaction capabilities. The core never talks to a UI
/// directly.
#[async_trait]
pub trait UiCallbacks: Send + Sync {
    /// A device with no seed shows this fingerprint so the user can verify
    /// it on an already-paired device before the seed is released. Resolve
    /// with a manually-entered seed (base64), or `None` to cancel, which
    /// signs the device out.
    async fn prompt_for_seed(&self, device_fingerprint: &str) -> Option<String>;

    /// Ask the user to verify a peer's key fingerprint before a secret is
    /// encrypted to that key. `false` aborts the operation.
    async fn confirm_fingerprint(&self, prompt: &str, fingerprint: &str) -> bool;
}

impl Connection {
    /// Fetch another user's DH public key (raw bytes), for use with
    /// [`Connection::grant_database_access`].
    pub async fn get_public_key(&self, username: &str) -> Result<Vec<u8>, ClientError> {
        self.inner.ensure_ready().await?;
        let data = self
            .inner
            .request(Action::GetPublicKey, &GetPublicKeyParams { username: username.to_string() })
            .await?
            .ok_or_else(|| ClientError::MalformedResponse("GetPublicKey returned no data".into()))?;
        let body: UserPublicKey = serde_json::from_value(data)?;
        Ok(STANDARD.decode(&body.public_key)?)
    }

    /// Grant `username` access to an open database. The database key is
    /// wrapped under the pairwise shared key with the grantee; the user
    /// confirms the grantee's fingerprint first.
    pub async fn grant_database_access(
        &self,
        db_name: &str,
        username: &str,
        grantee_public_key: &[u8],
        read_only: bool,
    ) -> Result<(), ClientError> {
        self.inner.ensure_ready().await?;

        let fingerprint = hash::fingerprint(grantee_public_key);
        let prompt = format!("Grant {username} access to \"{db_name}\"?");
        if !self.inner.ui.confirm_fingerprint(&prompt, &fingerprint).await {
            info!(username, "grant declined at fingerprint confirmation");
            return Err(ClientError::Canceled);
        }

        let params = {
            let st = self.inner.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            let db_name_hash = hash::hmac_hex(&keys.hmac_key, db_name.as_bytes());
            let db = st
                .databases
                .get(&db_name_hash)
                .filter(|db| db.is_init())
                .ok_or_else(|| ClientError::DatabaseNotOpen(db_name.to_string()))?;
            let db_id = db
                .db_id()
                .ok_or_else(|| ClientError::DatabaseNotOpen(db_name.to_string()))?
                .to_string();
            let db_key = db
                .db_key()
                .ok_or_else(|| ClientError::DatabaseNotOpen(db_name.to_string()))?;
            let shared = keys.dh_private_key.shared_key(grantee_public_key)?;
            GrantDatabaseAccessParams {
                username: username.to_string(),
                db_id,
                encrypted_access_key: aead::wrap_key(&shared, db_key)?,
                read_only,
            }
        };

        self.inner.request(Action::GrantDatabaseAccess, &params).await?;
        info!(username, db = db_name, "database access granted");
        Ok(())
    }

    /// Enumerate pending grants from other users and accept each one the
    /// user confirms. Returns the names of the databases accepted. A grant
    /// that fails to decrypt or that the user declines does not stop the
    /// rest.
    pub async fn get_database_access_grants(&self) -> Result<Vec<String>, ClientError> {
        self.inner.ensure_ready().await?;
        let data = self
            .inner
            .request(Action::GetDatabaseAccessGrants, &NoParams {})
            .await?;
        let list: DatabaseAccessGrantList = match data {
            Some(value) => serde_json::from_value(value)?,
            None => DatabaseAccessGrantList::default(),
        };

        let mut accepted = Vec::new();
        for grant in &list.grants {
            match self.inner.accept_grant(grant).await {
                Ok(Some(db_name)) => accepted.push(db_name),
                Ok(None) => debug!(db_id = %grant.db_id, "grant declined"),
                Err(e) => warn!(db_id = %grant.db_id, error = %e, "skipping grant"),
            }
        }
        Ok(accepted)
    }
}

impl ConnectionInner {
    /// Decrypt one grant, confirm it with the user, rewrap the database key
    /// under this user's own encryption key, and tell the server.
    pub(crate) async fn accept_grant(
        &self,
        grant: &DatabaseAccessGrant,
    ) -> Result<Option<String>, ClientError> {
        let grantor_public = STANDARD.decode(&grant.grantor_public_key)?;

        let shared = {
            let st = self.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            keys.dh_private_key.shared_key(&grantor_public)?
        };
        let db_key = aead::unwrap_key(&shared, &grant.encrypted_access_key)?;
        let db_name = aead::decrypt_string(&db_key, &grant.encrypted_db_name)?;

        let fingerprint = hash::fingerprint(&grantor_public);
        let prompt = format!("Accept access to \"{db_name}\"?");
        if !self.ui.confirm_fingerprint(&prompt, &fingerprint).await {
            return Ok(None);
        }

        let params = {
            let st = self.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            AcceptDatabaseAccessParams {
                db_id: grant.db_id.clone(),
                encrypted_db_key: aead::wrap_key(&keys.encryption_key, &db_key)?,
                db_name_hash: hash::hmac_hex(&keys.hmac_key, db_name.as_bytes()),
                encrypted_db_name: aead::encrypt_string(&db_key, &db_name)?,
            }
        };
        self.request(Action::AcceptDatabaseAccess, &params).await?;
        info!(db = %db_name, "database access accepted");
        Ok(Some(db_name))
    }

    /// Answer one device-pairing request: confirm the requester's
    /// fingerprint, then send the seed encrypted to its ephemeral key.
    /// At most one attempt per requester key, ever; failures are logged,
    /// never propagated.
    pub(crate) async fn send_seed_to(&self, requester_public_key: String) {
        if let Err(e) = self.try_send_seed(&requester_public_key).await {
            warn!(error = %e, "seed send failed");
        }
    }

    async fn try_send_seed(&self, requester_public_key_b64: &str) -> Result<(), ClientError> {
        let requester_public = STANDARD.decode(requester_public_key_b64)?;
        let dedup_key = hex::encode(hash::sha256(&requester_public));
        {
            let mut st = self.state.lock().await;
            if st.keys.is_none() {
                // Not able to answer yet; the requester will retry.
                return Ok(());
            }
            if !st.sent_seed_to.insert(dedup_key) {
                debug!("seed already offered to this device key; skipping");
                return Ok(());
            }
        }

        let fingerprint = hash::fingerprint(&requester_public);
        let prompt = "A new device is requesting this account's seed. Verify the fingerprint shown on it.";
        if !self.ui.confirm_fingerprint(prompt, &fingerprint).await {
            info!(%fingerprint, "seed send declined");
            return Ok(());
        }

        let (shared, seed_b64) = {
            let st = self.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            let seed = st.seed.as_ref().ok_or(ClientError::MissingSeed)?;
            (
                keys.dh_private_key.shared_key(&requester_public)?,
                STANDARD.encode(seed.as_slice()),
            )
        };
        let encrypted_seed = aead::encrypt_string(&shared, &seed_b64)?;

        self.request(
            Action::SendSeed,
            &SendSeedParams {
                requester_public_key: requester_public_key_b64.to_string(),
                encrypted_seed,
            },
        )
        .await?;
        info!(%fingerprint, "seed sent to new device");
        Ok(())
    }
}
