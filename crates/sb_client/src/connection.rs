//! Connection lifecycle, request multiplexing, and inbound routing.
//!
//! One [`Client`] per signed-in user; at most one live [`Connection`] per
//! client at a time. The connection drives an explicit state machine:
//!
//! Disconnected → Opening → {NeedSeed | HaveSeed} → KeyInit → Ready
//!
//! A single spawned reader task owns inbound dispatch. Outbound requests
//! carry fresh uuid correlation ids and resolve through per-request oneshot
//! slots; both the connect handshake and every request run under a 10 s
//! deadline. Closing, for any reason, fails everything pending, drops the
//! database set, and zeroizes all key material.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use sb_crypto::{aead, dh::DhPrivateKey, hash, SymmetricKey};
use sb_proto::action::{
    BatchTransactionParams, BundleParams, CreateDatabaseParams, DatabaseList, DatabaseSummary,
    GetDatabaseParams, ItemParams, NewDatabaseParams, NoParams, OpenDatabaseParams,
    RequestSeedParams, SeedDelivery, SeedRequestList, SignOutParams, ValidateKeyParams,
};
use sb_proto::event::{ApplyTransactionsEvent, ConnectionEvent, Salts};
use sb_proto::transaction::{CommandKind, Operation, WireOperation};
use sb_proto::{Action, ClientRequest, InboundMessage, Response, ServerEvent};
use sb_store::LocalStore;

use crate::access::UiCallbacks;
use crate::config::ClientConfig;
use crate::database::{ChangeHandler, Database, Item};
use crate::error::ClientError;
use crate::keys::{DecodedSalts, DerivedKeys};
use crate::transport::{Transport, WsTransport};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Decrypted metadata for a database this user can reach.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub db_id: String,
    pub is_owner: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Opening,
    NeedSeed,
    HaveSeed,
    KeyInit,
    Ready,
    Disconnected,
}

struct PendingRequest {
    action: Action,
    resolve: oneshot::Sender<Result<Option<Value>, ClientError>>,
}

pub(crate) struct ConnState {
    pub(crate) phase: Phase,
    pub(crate) salts: Option<Salts>,
    pub(crate) encrypted_validation_message: Option<String>,
    pub(crate) seed: Option<Zeroizing<Vec<u8>>>,
    pub(crate) keys: Option<DerivedKeys>,
    pending: HashMap<String, PendingRequest>,
    pub(crate) databases: HashMap<String, Database>,
    pub(crate) db_id_to_hash: HashMap<String, String>,
    pub(crate) sent_seed_to: HashSet<String>,
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ClientConfig,
    pub(crate) store: LocalStore,
    pub(crate) ui: Arc<dyn UiCallbacks>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: Mutex<ConnState>,
    pub(crate) closed: AtomicBool,
    /// Signalled once the server's `Connection` event has been absorbed.
    connection_ready: Notify,
    /// Signalled when a pushed seed has been decrypted and persisted.
    pub(crate) seed_ready: Notify,
}

/// Entry point: explicitly constructed per user, owns the one-live-connection
/// registry.
pub struct Client {
    config: ClientConfig,
    store: LocalStore,
    ui: Arc<dyn UiCallbacks>,
    active: StdMutex<Weak<ConnectionInner>>,
}

/// Handle to a live connection. Cheap to clone; the connection stays alive
/// until [`Connection::close`], [`Connection::sign_out`], or transport loss.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig, store: LocalStore, ui: Arc<dyn UiCallbacks>) -> Self {
        Self {
            config,
            store,
            ui,
            active: StdMutex::new(Weak::new()),
        }
    }

    /// Dial the configured server over WebSocket and run the full connect
    /// handshake (salts, seed acquisition, key derivation, validation).
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let url = self.config.ws_url()?;
        let transport = WsTransport::connect(&url).await?;
        self.connect_with_transport(Arc::new(transport)).await
    }

    /// Same handshake over an injected transport.
    pub async fn connect_with_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<Connection, ClientError> {
        self.store
            .save_session(&self.config.username, &self.config.session_id)
            .await?;

        let inner = {
            let mut active = self.active.lock().expect("connection registry lock");
            if let Some(existing) = active.upgrade() {
                if !existing.closed.load(Ordering::SeqCst) {
                    return Err(ClientError::AlreadyConnected);
                }
            }
            let inner = Arc::new(ConnectionInner {
                config: self.config.clone(),
                store: self.store.clone(),
                ui: Arc::clone(&self.ui),
                transport,
                state: Mutex::new(ConnState {
                    phase: Phase::Opening,
                    salts: None,
                    encrypted_validation_message: None,
                    seed: None,
                    keys: None,
                    pending: HashMap::new(),
                    databases: HashMap::new(),
                    db_id_to_hash: HashMap::new(),
                    sent_seed_to: HashSet::new(),
                }),
                closed: AtomicBool::new(false),
                connection_ready: Notify::new(),
                seed_ready: Notify::new(),
            });
            *active = Arc::downgrade(&inner);
            inner
        };

        tokio::spawn(ConnectionInner::read_loop(Arc::clone(&inner)));

        match inner.drive_handshake().await {
            Ok(()) => Ok(Connection { inner }),
            Err(e) => {
                inner.shutdown().await;
                Err(e)
            }
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

impl ConnectionInner {
    async fn drive_handshake(self: &Arc<Self>) -> Result<(), ClientError> {
        // The server opens with a `Connection` event carrying salts and the
        // validation challenge.
        timeout(CONNECT_TIMEOUT, self.connection_ready.notified())
            .await
            .map_err(|_| ClientError::Timeout)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Disconnected);
        }

        let seed: Zeroizing<Vec<u8>> = match self.store.get_seed(&self.config.username).await? {
            Some(b64) => {
                self.set_phase(Phase::HaveSeed).await;
                Zeroizing::new(STANDARD.decode(b64.as_str())?)
            }
            None => self.acquire_seed().await?,
        };

        self.init_keys(seed).await?;
        self.validate_key().await?;
        self.set_phase(Phase::Ready).await;
        info!(username = %self.config.username, "connection ready");

        // Answer seed requests that queued while this user was offline.
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.answer_pending_seed_requests().await });
        Ok(())
    }

    /// New-device path: solicit the seed from a paired device, falling back
    /// to manual entry through the injected UI.
    async fn acquire_seed(self: &Arc<Self>) -> Result<Zeroizing<Vec<u8>>, ClientError> {
        self.set_phase(Phase::NeedSeed).await;
        let username = self.config.username.clone();

        let seed_request_key = match self.store.get_seed_request(&username).await? {
            Some(blob) => DhPrivateKey::from_slice(&STANDARD.decode(blob.as_str())?)?,
            None => {
                let fresh = DhPrivateKey::generate();
                self.store
                    .set_seed_request(&username, &STANDARD.encode(fresh.to_bytes()))
                    .await?;
                fresh
            }
        };
        let requester_public_key = STANDARD.encode(seed_request_key.public_key());

        let data = self
            .request(
                Action::RequestSeed,
                &RequestSeedParams { requester_public_key: requester_public_key.clone() },
            )
            .await?;

        if let Some(data) = data {
            if let Ok(delivery) = serde_json::from_value::<SeedDelivery>(data) {
                if let (Some(encrypted_seed), Some(sender_public_key)) =
                    (delivery.encrypted_seed, delivery.sender_public_key)
                {
                    let sender_pub = STANDARD.decode(&sender_public_key)?;
                    let shared = seed_request_key.shared_key(&sender_pub)?;
                    let seed_b64 = aead::decrypt_string(&shared, &encrypted_seed)?;
                    self.store.save_seed(&username, &seed_b64).await?;
                    self.store.remove_seed_request(&username).await?;
                    info!("seed delivered by paired device");
                    return Ok(Zeroizing::new(STANDARD.decode(seed_b64.as_bytes())?));
                }
            }
        }

        // Nothing queued server-side. Show this device's fingerprint (the
        // paired device's user verifies it before releasing the seed) and
        // wait for whichever comes first: a pushed seed or manual entry.
        let device_fingerprint = hash::fingerprint(&seed_request_key.public_key());
        info!(%device_fingerprint, "no seed on record; awaiting paired device or manual entry");

        tokio::select! {
            _ = self.seed_ready.notified() => {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(ClientError::Disconnected);
                }
                let b64 = self
                    .store
                    .get_seed(&username)
                    .await?
                    .ok_or(ClientError::MissingSeed)?;
                Ok(Zeroizing::new(STANDARD.decode(b64.as_str())?))
            }
            manual = self.ui.prompt_for_seed(&device_fingerprint) => match manual {
                Some(entered) => {
                    let entered = entered.trim().to_string();
                    let seed = Zeroizing::new(STANDARD.decode(entered.as_bytes())?);
                    self.store.save_seed(&username, &entered).await?;
                    self.store.remove_seed_request(&username).await?;
                    info!("seed entered manually");
                    Ok(seed)
                }
                None => {
                    warn!("seed prompt dismissed; signing out");
                    self.sign_out_internal().await;
                    Err(ClientError::Canceled)
                }
            }
        }
    }

    async fn init_keys(&self, seed: Zeroizing<Vec<u8>>) -> Result<(), ClientError> {
        let mut st = self.state.lock().await;
        st.phase = Phase::KeyInit;
        let salts = st.salts.as_ref().ok_or(ClientError::MissingSalts)?;
        let decoded = DecodedSalts::from_wire(salts)?;
        st.keys = Some(DerivedKeys::derive(&seed, &decoded)?);
        st.seed = Some(seed);
        debug!("derived key set from seed and salts");
        Ok(())
    }

    /// Decrypt the server's validation challenge under the client-server DH
    /// key and echo the plaintext back. Any failure here is fatal: the
    /// derived keys do not match what the server has on record.
    async fn validate_key(self: &Arc<Self>) -> Result<(), ClientError> {
        let validation_message = {
            let st = self.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            let challenge = st
                .encrypted_validation_message
                .as_ref()
                .ok_or(ClientError::MissingSalts)?;
            let shared = keys
                .dh_private_key
                .shared_key(&self.config.server_public_key)?;
            let ciphertext = STANDARD.decode(challenge)?;
            let nonce = aead::decrypt(&shared, &ciphertext)
                .map_err(|_| ClientError::KeyValidationFailed)?;
            STANDARD.encode(&*nonce)
        };

        self.request(Action::ValidateKey, &ValidateKeyParams { validation_message })
            .await
            .map_err(|e| match e {
                ClientError::RequestFailed { .. } => ClientError::KeyValidationFailed,
                other => other,
            })?;
        debug!("key validation succeeded");
        Ok(())
    }

    async fn set_phase(&self, phase: Phase) {
        self.state.lock().await.phase = phase;
    }

    pub(crate) async fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state.lock().await.phase {
            Phase::Ready => Ok(()),
            _ => Err(ClientError::Disconnected),
        }
    }
}

// ── Request multiplexing ─────────────────────────────────────────────────────

impl ConnectionInner {
    /// Submit one action and await its correlated response.
    ///
    /// Resolves with the response `data` on status 200; fails with
    /// `RequestFailed` on any other status, `Timeout` after the deadline
    /// (removing the pending slot), or `Disconnected` if the connection
    /// closes first.
    pub(crate) async fn request<P: Serialize>(
        &self,
        action: Action,
        params: &P,
    ) -> Result<Option<Value>, ClientError> {
        let req = ClientRequest::new(action, params)?;
        let (resolve, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            if st.phase == Phase::Disconnected {
                return Err(ClientError::Disconnected);
            }
            st.pending
                .insert(req.request_id.clone(), PendingRequest { action, resolve });
        }

        let frame = req.to_json()?;
        if let Err(e) = self.transport.send(frame).await {
            self.state.lock().await.pending.remove(&req.request_id);
            return Err(e);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.state.lock().await.pending.remove(&req.request_id);
                warn!(%action, request_id = %req.request_id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    async fn handle_response(&self, resp: Response) {
        let pending = self.state.lock().await.pending.remove(&resp.request_id);
        let Some(p) = pending else {
            debug!(
                request_id = %resp.request_id,
                "response for unknown or already-resolved request; discarding"
            );
            return;
        };
        let body = resp.response;
        let result = if body.is_success() {
            Ok(body.data)
        } else {
            Err(ClientError::RequestFailed {
                action: p.action,
                status: body.status,
                message: body.message.unwrap_or_default(),
            })
        };
        // The requester may have timed out and gone away; that is fine.
        let _ = p.resolve.send(result);
    }
}

// ── Inbound routing ──────────────────────────────────────────────────────────

impl ConnectionInner {
    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                None => {
                    debug!("transport closed");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "transport failure");
                    break;
                }
                Some(Ok(frame)) => {
                    if let Err(e) = self.dispatch(&frame).await {
                        error!(error = %e, "fatal error handling server message; closing");
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn dispatch(self: &Arc<Self>, frame: &str) -> Result<(), ClientError> {
        let msg = match InboundMessage::parse(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "unparseable frame; discarding");
                return Ok(());
            }
        };

        match msg {
            InboundMessage::Response(resp) => {
                self.handle_response(resp).await;
                Ok(())
            }
            InboundMessage::Event(ServerEvent::Connection(event)) => {
                self.handle_connection_event(event).await;
                Ok(())
            }
            InboundMessage::Event(ServerEvent::ApplyTransactions(event)) => {
                self.handle_apply_transactions(event).await
            }
            InboundMessage::Event(ServerEvent::BuildBundle { db_id }) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.submit_bundle(db_id).await });
                Ok(())
            }
            InboundMessage::Event(ServerEvent::ReceiveRequestForSeed { requester_public_key }) => {
                if self.state.lock().await.keys.is_some() {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.send_seed_to(requester_public_key).await });
                } else {
                    debug!("seed request before key initialisation; ignoring");
                }
                Ok(())
            }
            InboundMessage::Event(ServerEvent::ReceiveSeed { encrypted_seed, sender_public_key }) => {
                self.handle_receive_seed(encrypted_seed, sender_public_key).await;
                Ok(())
            }
            InboundMessage::Unknown { route } => {
                warn!(?route, "unknown route; discarding");
                Ok(())
            }
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        {
            let mut st = self.state.lock().await;
            st.salts = Some(event.salts);
            st.encrypted_validation_message = Some(event.encrypted_validation_message);
        }
        debug!("received salts and validation challenge");
        self.connection_ready.notify_one();
    }

    /// Route a transaction push to its replica. Pushes for databases this
    /// connection has not opened are silently ignored; decryption failures
    /// inside an opened database are fatal.
    async fn handle_apply_transactions(
        &self,
        event: ApplyTransactionsEvent,
    ) -> Result<(), ClientError> {
        let mut st = self.state.lock().await;
        let Some(encryption_key) = st.keys.as_ref().map(|k| k.encryption_key.clone()) else {
            warn!(db_id = %event.db_id, "transactions before key initialisation; ignoring");
            return Ok(());
        };

        let db_name_hash = match event
            .db_name_hash
            .clone()
            .or_else(|| st.db_id_to_hash.get(&event.db_id).cloned())
        {
            Some(h) => h,
            None => {
                debug!(db_id = %event.db_id, "transactions for unknown database; ignoring");
                return Ok(());
            }
        };

        match st.databases.get_mut(&db_name_hash) {
            Some(db) => db.apply_message(&encryption_key, &event)?,
            None => {
                debug!(db_id = %event.db_id, "no open database for this hash; ignoring");
                return Ok(());
            }
        }

        // Register the id→hash route only once the replica is initialised;
        // later pushes for this database arrive with the bare db_id.
        st.db_id_to_hash.insert(event.db_id.clone(), db_name_hash);
        Ok(())
    }

    /// The server asked for a fresh snapshot of one database.
    async fn submit_bundle(&self, db_id: String) {
        let result: Result<(), ClientError> = async {
            let params = {
                let st = self.state.lock().await;
                let hmac_key = st
                    .keys
                    .as_ref()
                    .map(|k| k.hmac_key.clone())
                    .ok_or(ClientError::MissingSeed)?;
                let db_name_hash = st
                    .db_id_to_hash
                    .get(&db_id)
                    .cloned()
                    .ok_or_else(|| ClientError::DatabaseNotOpen(db_id.clone()))?;
                let db = st
                    .databases
                    .get(&db_name_hash)
                    .ok_or_else(|| ClientError::DatabaseNotOpen(db_id.clone()))?;
                let (seq_no, bundle, keys) = db.build_bundle(&hmac_key)?;
                BundleParams { db_id: db_id.clone(), seq_no, bundle, keys }
            };
            self.request(Action::Bundle, &params).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => debug!(%db_id, "bundle submitted"),
            Err(e) => warn!(%db_id, error = %e, "bundle submission failed"),
        }
    }

    /// A paired device answered our seed request. Failures are isolated:
    /// an undecryptable delivery is dropped, not fatal.
    async fn handle_receive_seed(&self, encrypted_seed: String, sender_public_key: String) {
        let username = self.config.username.clone();
        let result: Result<(), ClientError> = async {
            let blob = self
                .store
                .get_seed_request(&username)
                .await?
                .ok_or(ClientError::MissingSeed)?;
            let seed_request_key = DhPrivateKey::from_slice(&STANDARD.decode(blob.as_str())?)?;
            let sender_pub = STANDARD.decode(&sender_public_key)?;
            let shared = seed_request_key.shared_key(&sender_pub)?;
            let seed_b64 = aead::decrypt_string(&shared, &encrypted_seed)?;
            self.store.save_seed(&username, &seed_b64).await?;
            self.store.remove_seed_request(&username).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("seed received from paired device");
                self.seed_ready.notify_one();
            }
            Err(e) => warn!(error = %e, "discarding seed delivery"),
        }
    }

    async fn answer_pending_seed_requests(self: Arc<Self>) {
        let result: Result<(), ClientError> = async {
            let data = self.request(Action::GetRequestsForSeed, &NoParams {}).await?;
            let list: SeedRequestList = match data {
                Some(value) => serde_json::from_value(value)?,
                None => return Ok(()),
            };
            for req in list.seed_requests {
                // Per-request failures are isolated inside send_seed_to.
                self.send_seed_to(req.requester_public_key).await;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to fetch pending seed requests");
        }
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

impl ConnectionInner {
    /// Idempotent teardown: close the transport, fail everything pending,
    /// drop replicas, zeroize keys and seed.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.close().await;

        let mut st = self.state.lock().await;
        st.phase = Phase::Disconnected;
        for (_, pending) in st.pending.drain() {
            let _ = pending.resolve.send(Err(ClientError::Disconnected));
        }
        st.databases.clear();
        st.db_id_to_hash.clear();
        // Dropping these zeroizes the key material.
        st.keys = None;
        st.seed = None;
        drop(st);

        // Wake any handshake waiter so it observes the closed flag.
        self.connection_ready.notify_one();
        self.seed_ready.notify_one();
        info!("connection closed");
    }

    pub(crate) async fn sign_out_internal(&self) {
        // Local artifacts go first: a network failure must not leave this
        // device signed in locally.
        if let Err(e) = self.store.sign_out_session(&self.config.username).await {
            error!(error = %e, "failed to clear local session state");
        }
        let _ = self
            .request(
                Action::SignOut,
                &SignOutParams { session_id: self.config.session_id.clone() },
            )
            .await;
        self.shutdown().await;
    }
}

// ── Public connection surface ────────────────────────────────────────────────

impl Connection {
    /// Open (or create) a database and subscribe to its changes. State
    /// arrives asynchronously via the server's transaction pushes; the
    /// subscriber fires after each applied push.
    pub async fn open_database(
        &self,
        db_name: &str,
        on_change: ChangeHandler,
    ) -> Result<(), ClientError> {
        self.inner.ensure_ready().await?;

        let (db_name_hash, params) = {
            let mut st = self.inner.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            let db_name_hash = hash::hmac_hex(&keys.hmac_key, db_name.as_bytes());
            let encryption_key = keys.encryption_key.clone();

            if let Some(db) = st.databases.get_mut(&db_name_hash) {
                // Re-open: replace the subscriber, keep the replica.
                db.set_on_change(on_change);
                return Ok(());
            }

            // Wrap a candidate key in case the database does not exist yet;
            // the server ignores these params when it does.
            let candidate_key = SymmetricKey::generate();
            let new_database_params = NewDatabaseParams {
                encrypted_db_name: aead::encrypt_string(&candidate_key, db_name)?,
                encrypted_db_key: aead::wrap_key(&encryption_key, &candidate_key)?,
            };

            st.databases.insert(
                db_name_hash.clone(),
                Database::new(db_name.to_string(), db_name_hash.clone(), on_change),
            );
            (
                db_name_hash.clone(),
                OpenDatabaseParams {
                    db_name_hash,
                    new_database_params: Some(new_database_params),
                },
            )
        };

        match self.inner.request(Action::OpenDatabase, &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Roll back the placeholder unless a push already landed.
                let mut st = self.inner.state.lock().await;
                if st.databases.get(&db_name_hash).is_some_and(|db| !db.is_init()) {
                    st.databases.remove(&db_name_hash);
                }
                Err(e)
            }
        }
    }

    /// Current items of an open database, in insertion order.
    pub async fn get_items(&self, db_name: &str) -> Result<Vec<Item>, ClientError> {
        let st = self.inner.state.lock().await;
        let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
        let db_name_hash = hash::hmac_hex(&keys.hmac_key, db_name.as_bytes());
        let db = st
            .databases
            .get(&db_name_hash)
            .filter(|db| db.is_init())
            .ok_or_else(|| ClientError::DatabaseNotOpen(db_name.to_string()))?;
        Ok(db.get_items())
    }

    pub async fn insert(
        &self,
        db_name: &str,
        item_id: &str,
        record: Value,
    ) -> Result<(), ClientError> {
        self.mutate(db_name, Operation::Insert { item_id: item_id.to_string(), record })
            .await
    }

    pub async fn update(
        &self,
        db_name: &str,
        item_id: &str,
        record: Value,
    ) -> Result<(), ClientError> {
        self.mutate(db_name, Operation::Update { item_id: item_id.to_string(), record })
            .await
    }

    pub async fn delete(&self, db_name: &str, item_id: &str) -> Result<(), ClientError> {
        self.mutate(db_name, Operation::Delete { item_id: item_id.to_string() })
            .await
    }

    /// Submit an ordered operation list that the server applies under one
    /// sequence number (and replicas apply atomically).
    pub async fn batch_transaction(
        &self,
        db_name: &str,
        operations: Vec<Operation>,
    ) -> Result<(), ClientError> {
        self.inner.ensure_ready().await?;
        let params = {
            let st = self.inner.state.lock().await;
            let (db_id, db_key, hmac_key) = lookup_open_database(&st, db_name)?;
            BatchTransactionParams {
                db_id,
                operations: operations
                    .iter()
                    .map(|op| {
                        Ok(WireOperation {
                            command: op.command(),
                            item_key: hash::hmac_hex(&hmac_key, op.item_id().as_bytes()),
                            sealed_op: op.seal(&db_key)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ClientError>>()?,
            }
        };
        self.inner.request(Action::BatchTransaction, &params).await?;
        Ok(())
    }

    async fn mutate(&self, db_name: &str, op: Operation) -> Result<(), ClientError> {
        self.inner.ensure_ready().await?;
        let (action, params) = {
            let st = self.inner.state.lock().await;
            let (db_id, db_key, hmac_key) = lookup_open_database(&st, db_name)?;
            let action = match op.command() {
                CommandKind::Insert => Action::Insert,
                CommandKind::Update => Action::Update,
                CommandKind::Delete => Action::Delete,
                CommandKind::BatchTransaction => unreachable!("single ops only"),
            };
            let params = ItemParams {
                db_id,
                item_key: hash::hmac_hex(&hmac_key, op.item_id().as_bytes()),
                sealed_op: op.seal(&db_key)?,
            };
            (action, params)
        };
        // No local mutation here: the server's push is the single source of
        // truth, and it arrives after this request resolves.
        self.inner.request(action, &params).await?;
        Ok(())
    }

    /// Explicitly create a database without opening it.
    pub async fn create_database(&self, db_name: &str) -> Result<(), ClientError> {
        self.inner.ensure_ready().await?;
        let params = {
            let st = self.inner.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            let db_key = SymmetricKey::generate();
            CreateDatabaseParams {
                db_name_hash: hash::hmac_hex(&keys.hmac_key, db_name.as_bytes()),
                encrypted_db_name: aead::encrypt_string(&db_key, db_name)?,
                encrypted_db_key: aead::wrap_key(&keys.encryption_key, &db_key)?,
            }
        };
        self.inner.request(Action::CreateDatabase, &params).await?;
        Ok(())
    }

    /// Look up one database's decrypted metadata; `None` if the server does
    /// not know the name.
    pub async fn get_database(&self, db_name: &str) -> Result<Option<DatabaseInfo>, ClientError> {
        self.inner.ensure_ready().await?;
        let db_name_hash = {
            let st = self.inner.state.lock().await;
            let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
            hash::hmac_hex(&keys.hmac_key, db_name.as_bytes())
        };
        let data = match self
            .inner
            .request(Action::GetDatabase, &GetDatabaseParams { db_name_hash })
            .await
        {
            Ok(data) => data,
            Err(ClientError::RequestFailed { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let summary: DatabaseSummary = serde_json::from_value(
            data.ok_or_else(|| ClientError::MalformedResponse("GetDatabase returned no data".into()))?,
        )?;
        let st = self.inner.state.lock().await;
        let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
        Ok(Some(decode_summary(keys, &summary)?))
    }

    /// Enumerate every database this user can reach, with names decrypted.
    /// Databases whose metadata fails to decrypt are skipped with a warning.
    pub async fn find_databases(&self) -> Result<Vec<DatabaseInfo>, ClientError> {
        self.inner.ensure_ready().await?;
        let data = self.inner.request(Action::FindDatabases, &NoParams {}).await?;
        let list: DatabaseList = match data {
            Some(value) => serde_json::from_value(value)?,
            None => DatabaseList::default(),
        };

        let st = self.inner.state.lock().await;
        let keys = st.keys.as_ref().ok_or(ClientError::MissingSeed)?;
        let mut found = Vec::with_capacity(list.databases.len());
        for summary in &list.databases {
            match decode_summary(keys, summary) {
                Ok(info) => found.push(info),
                Err(e) => warn!(db_id = %summary.db_id, error = %e, "skipping undecryptable database"),
            }
        }
        Ok(found)
    }

    /// Sign out this session: local artifacts are cleared first, then the
    /// server is told and the connection closes.
    pub async fn sign_out(&self) {
        self.inner.sign_out_internal().await;
    }

    /// Close the connection without touching the signed-in session.
    pub async fn close(&self) {
        self.inner.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response (diagnostics).
    pub async fn pending_request_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

fn lookup_open_database(
    st: &ConnState,
    db_name: &str,
) -> Result<(String, SymmetricKey, SymmetricKey), ClientError> {
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
        .cloned()
        .ok_or_else(|| ClientError::DatabaseNotOpen(db_name.to_string()))?;
    Ok((db_id, db_key, keys.hmac_key.clone()))
}

fn decode_summary(keys: &DerivedKeys, summary: &DatabaseSummary) -> Result<DatabaseInfo, ClientError> {
    let db_key = aead::unwrap_key(&keys.encryption_key, &summary.encrypted_db_key)?;
    let db_name = aead::decrypt_string(&db_key, &summary.encrypted_db_name)?;
    Ok(DatabaseInfo {
        db_name,
        db_id: summary.db_id.clone(),
        is_owner: summary.is_owner,
        read_only: summary.read_only,
    })
}
