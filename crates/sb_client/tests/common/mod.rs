//! Shared test harness: an in-process channel transport and a mock server
//! that speaks enough of the protocol for end-to-end flows with real
//! crypto (the only fake part is the wire).

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use sb_client::transport::Transport;
use sb_client::{ClientConfig, ClientError, UiCallbacks};
use sb_crypto::{aead, dh::DhPrivateKey, kdf};
use sb_store::LocalStore;

// ── Channel transport ────────────────────────────────────────────────────────

pub struct ChannelTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<(), ClientError> {
        self.to_server
            .send(frame)
            .map_err(|_| ClientError::Transport("mock server hung up".into()))
    }

    async fn recv(&self) -> Option<Result<String, ClientError>> {
        self.from_server.lock().await.recv().await.map(Ok)
    }

    async fn close(&self) {
        self.from_server.lock().await.close();
    }
}

// ── UI stubs ─────────────────────────────────────────────────────────────────

/// Confirms every fingerprint; the seed prompt never resolves (the paired
/// device is expected to answer first).
pub struct AutoConfirmUi;

#[async_trait]
impl UiCallbacks for AutoConfirmUi {
    async fn prompt_for_seed(&self, _device_fingerprint: &str) -> Option<String> {
        std::future::pending().await
    }

    async fn confirm_fingerprint(&self, _prompt: &str, _fingerprint: &str) -> bool {
        true
    }
}

/// Dismisses the seed prompt immediately (the cancel path).
pub struct CancelUi;

#[async_trait]
impl UiCallbacks for CancelUi {
    async fn prompt_for_seed(&self, _device_fingerprint: &str) -> Option<String> {
        None
    }

    async fn confirm_fingerprint(&self, _prompt: &str, _fingerprint: &str) -> bool {
        false
    }
}

/// Types a seed into the prompt, as a user restoring by hand would.
pub struct ManualSeedUi(pub String);

#[async_trait]
impl UiCallbacks for ManualSeedUi {
    async fn prompt_for_seed(&self, _device_fingerprint: &str) -> Option<String> {
        Some(self.0.clone())
    }

    async fn confirm_fingerprint(&self, _prompt: &str, _fingerprint: &str) -> bool {
        true
    }
}

// ── Mock server ──────────────────────────────────────────────────────────────

struct ClientHandle {
    username: String,
    to_client: mpsc::UnboundedSender<String>,
}

struct UserDbMeta {
    db_name_hash: String,
    encrypted_db_key: String,
    encrypted_db_name: String,
}

struct ServerDb {
    next_seq: u64,
    log: Vec<Value>,
    bundle: Option<(String, u64)>,
    per_user: HashMap<String, UserDbMeta>,
}

struct GrantRecord {
    db_id: String,
    grantor_public_key: String,
    encrypted_access_key: String,
    encrypted_db_name: String,
    read_only: bool,
}

#[derive(Default)]
struct ServerState {
    /// username → account DH public key (uploaded at "sign-up").
    users: HashMap<String, Vec<u8>>,
    clients: HashMap<u64, ClientHandle>,
    next_client: u64,
    dbs: HashMap<String, ServerDb>,
    /// (username, dbNameHash) → dbId
    name_index: HashMap<(String, String), String>,
    next_db: u64,
    /// grantee username → pending grants
    grants: HashMap<String, Vec<GrantRecord>>,
    /// (username, requesterPublicKey) → (encryptedSeed, senderPublicKey)
    queued_seeds: HashMap<(String, String), (String, String)>,
    /// username → requester public keys with no answer yet
    pending_seed_requests: HashMap<String, Vec<String>>,
    /// When set, requests get no response at all.
    silent: bool,
    /// When set, the next Insert response is held back until the one after
    /// it has been answered (exercises out-of-order correlation).
    defer_next_insert: bool,
    deferred: Option<(u64, String)>,
    /// Every dbNameHash seen in OpenDatabase, with its username.
    pub recorded_name_hashes: Vec<(String, String)>,
}

pub struct MockServer {
    server_key: DhPrivateKey,
    salts: [String; 3],
    validation_nonce: Vec<u8>,
    state: Mutex<ServerState>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let mut nonce = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let salt = || {
            let mut bytes = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            STANDARD.encode(bytes)
        };
        Arc::new(Self {
            server_key: DhPrivateKey::generate(),
            salts: [salt(), salt(), salt()],
            validation_nonce: nonce,
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn server_public_key(&self) -> [u8; 32] {
        self.server_key.public_key()
    }

    /// What a sign-up does: derive the account's DH public key from the seed
    /// and the user's salts, and put it on record.
    pub async fn register_user(&self, username: &str, seed: &[u8]) {
        let dh_salt = STANDARD.decode(&self.salts[1]).unwrap();
        let dh_key = kdf::derive_dh_private_key(seed, &dh_salt).unwrap();
        self.state
            .lock()
            .await
            .users
            .insert(username.to_string(), dh_key.public_key().to_vec());
    }

    /// Register a transport for a new client session and immediately push
    /// the `Connection` event (salts + validation challenge).
    pub async fn attach(self: &Arc<Self>, username: &str) -> Arc<ChannelTransport> {
        let (to_server, mut from_clients) = mpsc::unbounded_channel::<String>();
        let (to_client, from_server) = mpsc::unbounded_channel::<String>();

        let client_id = {
            let mut st = self.state.lock().await;
            let user_pub = st
                .users
                .get(username)
                .unwrap_or_else(|| panic!("user {username} not registered with mock server"))
                .clone();
            let shared = self.server_key.shared_key(&user_pub).unwrap();
            let challenge = STANDARD.encode(aead::encrypt(&shared, &self.validation_nonce).unwrap());

            let id = st.next_client;
            st.next_client += 1;
            st.clients.insert(
                id,
                ClientHandle { username: username.to_string(), to_client: to_client.clone() },
            );

            let event = json!({
                "route": "Connection",
                "salts": {
                    "encryptionKeySalt": self.salts[0],
                    "dhKeySalt": self.salts[1],
                    "hmacKeySalt": self.salts[2],
                },
                "encryptedValidationMessage": challenge,
            });
            to_client.send(event.to_string()).unwrap();
            id
        };

        let server = Arc::clone(self);
        let username = username.to_string();
        tokio::spawn(async move {
            while let Some(frame) = from_clients.recv().await {
                server.handle_frame(client_id, &username, &frame).await;
            }
            server.state.lock().await.clients.remove(&client_id);
        });

        Arc::new(ChannelTransport { to_server, from_server: Mutex::new(from_server) })
    }

    pub async fn set_silent(&self, silent: bool) {
        self.state.lock().await.silent = silent;
    }

    pub async fn defer_next_insert(&self) {
        self.state.lock().await.defer_next_insert = true;
    }

    pub async fn recorded_name_hashes(&self) -> Vec<(String, String)> {
        self.state.lock().await.recorded_name_hashes.clone()
    }

    pub async fn db_id_of(&self, username: &str, db_name_hash: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .name_index
            .get(&(username.to_string(), db_name_hash.to_string()))
            .cloned()
    }

    pub async fn has_bundle(&self, db_id: &str) -> bool {
        self.state
            .lock()
            .await
            .dbs
            .get(db_id)
            .is_some_and(|db| db.bundle.is_some())
    }

    /// Ask the owning client to snapshot a database.
    pub async fn push_build_bundle(&self, db_id: &str) {
        let st = self.state.lock().await;
        let frame = json!({ "route": "BuildBundle", "dbId": db_id }).to_string();
        for client in st.clients.values() {
            let _ = client.to_client.send(frame.clone());
        }
    }

    /// Inject a raw frame to every connected client (e.g. a response for an
    /// id nobody is waiting on).
    pub async fn push_raw(&self, frame: &str) {
        let st = self.state.lock().await;
        for client in st.clients.values() {
            let _ = client.to_client.send(frame.to_string());
        }
    }

    async fn handle_frame(self: &Arc<Self>, client_id: u64, username: &str, frame: &str) {
        let msg: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(_) => return,
        };
        let request_id = msg["requestId"].as_str().unwrap_or_default().to_string();
        let action = msg["action"].as_str().unwrap_or_default().to_string();
        let params = msg["params"].clone();

        let mut st = self.state.lock().await;
        if st.silent {
            return;
        }

        match action.as_str() {
            "ValidateKey" => {
                let ok = params["validationMessage"] == STANDARD.encode(&self.validation_nonce);
                if ok {
                    respond(&st, client_id, &request_id, 200, None, None);
                } else {
                    respond(&st, client_id, &request_id, 401, None, Some("key validation failed"));
                }
            }

            "SignOut" => respond(&st, client_id, &request_id, 200, None, None),

            "GetRequestsForSeed" => {
                let requests: Vec<Value> = st
                    .pending_seed_requests
                    .get(username)
                    .map(|pubs| {
                        pubs.iter().map(|p| json!({ "requesterPublicKey": p })).collect()
                    })
                    .unwrap_or_default();
                respond(&st, client_id, &request_id, 200, Some(json!({ "seedRequests": requests })), None);
            }

            "RequestSeed" => {
                let requester = params["requesterPublicKey"].as_str().unwrap_or_default().to_string();
                let queued = st.queued_seeds.get(&(username.to_string(), requester.clone())).cloned();
                match queued {
                    Some((encrypted_seed, sender_public_key)) => respond(
                        &st,
                        client_id,
                        &request_id,
                        200,
                        Some(json!({
                            "encryptedSeed": encrypted_seed,
                            "senderPublicKey": sender_public_key,
                        })),
                        None,
                    ),
                    None => {
                        st.pending_seed_requests
                            .entry(username.to_string())
                            .or_default()
                            .push(requester.clone());
                        push_to_user_except(
                            &st,
                            username,
                            client_id,
                            &json!({ "route": "ReceiveRequestForSeed", "requesterPublicKey": requester }),
                        );
                        respond(&st, client_id, &request_id, 200, Some(json!({})), None);
                    }
                }
            }

            "SendSeed" => {
                let requester = params["requesterPublicKey"].as_str().unwrap_or_default().to_string();
                let encrypted_seed = params["encryptedSeed"].as_str().unwrap_or_default().to_string();
                let sender_public_key = STANDARD.encode(st.users.get(username).cloned().unwrap_or_default());
                st.queued_seeds.insert(
                    (username.to_string(), requester.clone()),
                    (encrypted_seed.clone(), sender_public_key.clone()),
                );
                if let Some(pending) = st.pending_seed_requests.get_mut(username) {
                    pending.retain(|p| p != &requester);
                }
                push_to_user_except(
                    &st,
                    username,
                    client_id,
                    &json!({
                        "route": "ReceiveSeed",
                        "encryptedSeed": encrypted_seed,
                        "senderPublicKey": sender_public_key,
                    }),
                );
                respond(&st, client_id, &request_id, 200, None, None);
            }

            "GetPublicKey" => {
                let target = params["username"].as_str().unwrap_or_default();
                match st.users.get(target) {
                    Some(public) => {
                        let b64 = STANDARD.encode(public);
                        respond(&st, client_id, &request_id, 200, Some(json!({ "publicKey": b64 })), None);
                    }
                    None => respond(&st, client_id, &request_id, 404, None, Some("unknown user")),
                }
            }

            "OpenDatabase" => {
                let db_name_hash = params["dbNameHash"].as_str().unwrap_or_default().to_string();
                st.recorded_name_hashes.push((username.to_string(), db_name_hash.clone()));

                let key = (username.to_string(), db_name_hash.clone());
                let db_id = match st.name_index.get(&key).cloned() {
                    Some(id) => id,
                    None => {
                        let Some(new_params) = params.get("newDatabaseParams") else {
                            respond(&st, client_id, &request_id, 404, None, Some("database not found"));
                            return;
                        };
                        let id = format!("db-{}", st.next_db);
                        st.next_db += 1;
                        let meta = UserDbMeta {
                            db_name_hash: db_name_hash.clone(),
                            encrypted_db_key: new_params["encryptedDbKey"].as_str().unwrap_or_default().into(),
                            encrypted_db_name: new_params["encryptedDbName"].as_str().unwrap_or_default().into(),
                        };
                        let mut per_user = HashMap::new();
                        per_user.insert(username.to_string(), meta);
                        st.dbs.insert(
                            id.clone(),
                            ServerDb { next_seq: 0, log: Vec::new(), bundle: None, per_user },
                        );
                        st.name_index.insert(key, id.clone());
                        id
                    }
                };

                let db = st.dbs.get(&db_id).expect("indexed db exists");
                let Some(meta) = db.per_user.get(username) else {
                    respond(&st, client_id, &request_id, 403, None, Some("no access"));
                    return;
                };
                let mut push = json!({
                    "route": "ApplyTransactions",
                    "dbId": db_id,
                    "dbNameHash": meta.db_name_hash,
                    "dbKey": meta.encrypted_db_key,
                    "transactionLog": db.log.clone(),
                });
                if let Some((bundle, seq_no)) = &db.bundle {
                    push["bundle"] = json!(bundle);
                    push["bundleSeqNo"] = json!(seq_no);
                }
                push_to_client(&st, client_id, &push);
                respond(&st, client_id, &request_id, 200, Some(json!({ "dbId": db_id })), None);
            }

            "Insert" | "Update" | "Delete" | "BatchTransaction" => {
                let db_id = params["dbId"].as_str().unwrap_or_default().to_string();
                if !st.dbs.contains_key(&db_id) {
                    respond(&st, client_id, &request_id, 404, None, Some("unknown database"));
                    return;
                }
                let db = st.dbs.get_mut(&db_id).unwrap();
                db.next_seq += 1;
                let seq_no = db.next_seq;
                let entry = if action == "BatchTransaction" {
                    json!({
                        "seqNo": seq_no,
                        "command": "BatchTransaction",
                        "operations": params["operations"].clone(),
                    })
                } else {
                    json!({
                        "seqNo": seq_no,
                        "command": action,
                        "itemKey": params["itemKey"].clone(),
                        "sealedOp": params["sealedOp"].clone(),
                    })
                };
                db.log.push(entry.clone());
                let members: Vec<String> = db.per_user.keys().cloned().collect();

                let push = json!({
                    "route": "ApplyTransactions",
                    "dbId": db_id,
                    "transactionLog": [entry],
                });
                for client in st.clients.values() {
                    if members.contains(&client.username) {
                        let _ = client.to_client.send(push.to_string());
                    }
                }

                let response = response_frame(&request_id, 200, None, None);
                if action == "Insert" && st.defer_next_insert && st.deferred.is_none() {
                    st.defer_next_insert = false;
                    st.deferred = Some((client_id, response));
                } else {
                    send_to_client(&st, client_id, &response);
                    if let Some((held_client, held)) = st.deferred.take() {
                        send_to_client(&st, held_client, &held);
                    }
                }
            }

            "Bundle" => {
                let db_id = params["dbId"].as_str().unwrap_or_default().to_string();
                let seq_no = params["seqNo"].as_u64().unwrap_or_default();
                let bundle = params["bundle"].as_str().unwrap_or_default().to_string();
                if !st.dbs.contains_key(&db_id) {
                    respond(&st, client_id, &request_id, 404, None, Some("unknown database"));
                    return;
                }
                let db = st.dbs.get_mut(&db_id).unwrap();
                db.bundle = Some((bundle, seq_no));
                db.log.retain(|entry| entry["seqNo"].as_u64().unwrap_or_default() > seq_no);
                respond(&st, client_id, &request_id, 200, None, None);
            }

            "GrantDatabaseAccess" => {
                let grantee = params["username"].as_str().unwrap_or_default().to_string();
                let grantor_public = STANDARD.encode(st.users.get(username).cloned().unwrap_or_default());
                let db_id = params["dbId"].as_str().unwrap_or_default().to_string();
                let encrypted_db_name = st
                    .dbs
                    .get(&db_id)
                    .and_then(|db| db.per_user.get(username))
                    .map(|meta| meta.encrypted_db_name.clone())
                    .unwrap_or_default();
                st.grants.entry(grantee).or_default().push(GrantRecord {
                    db_id,
                    grantor_public_key: grantor_public,
                    encrypted_access_key: params["encryptedAccessKey"].as_str().unwrap_or_default().into(),
                    encrypted_db_name,
                    read_only: params["readOnly"].as_bool().unwrap_or_default(),
                });
                respond(&st, client_id, &request_id, 200, None, None);
            }

            "GetDatabaseAccessGrants" => {
                let grants: Vec<Value> = st
                    .grants
                    .get(username)
                    .map(|records| {
                        records
                            .iter()
                            .map(|g| {
                                json!({
                                    "dbId": g.db_id,
                                    "grantorPublicKey": g.grantor_public_key,
                                    "encryptedAccessKey": g.encrypted_access_key,
                                    "encryptedDbName": g.encrypted_db_name,
                                    "readOnly": g.read_only,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                respond(&st, client_id, &request_id, 200, Some(json!({ "grants": grants })), None);
            }

            "AcceptDatabaseAccess" => {
                let db_id = params["dbId"].as_str().unwrap_or_default().to_string();
                let db_name_hash = params["dbNameHash"].as_str().unwrap_or_default().to_string();
                let meta = UserDbMeta {
                    db_name_hash: db_name_hash.clone(),
                    encrypted_db_key: params["encryptedDbKey"].as_str().unwrap_or_default().into(),
                    encrypted_db_name: params["encryptedDbName"].as_str().unwrap_or_default().into(),
                };
                if !st.dbs.contains_key(&db_id) {
                    respond(&st, client_id, &request_id, 404, None, Some("unknown database"));
                    return;
                }
                st.dbs
                    .get_mut(&db_id)
                    .unwrap()
                    .per_user
                    .insert(username.to_string(), meta);
                st.name_index
                    .insert((username.to_string(), db_name_hash), db_id.clone());
                if let Some(records) = st.grants.get_mut(username) {
                    records.retain(|g| g.db_id != db_id);
                }
                respond(&st, client_id, &request_id, 200, None, None);
            }

            "FindDatabases" => {
                let databases: Vec<Value> = st
                    .dbs
                    .iter()
                    .filter_map(|(db_id, db)| {
                        db.per_user.get(username).map(|meta| {
                            json!({
                                "dbId": db_id,
                                "dbNameHash": meta.db_name_hash,
                                "encryptedDbName": meta.encrypted_db_name,
                                "encryptedDbKey": meta.encrypted_db_key,
                                "isOwner": true,
                                "readOnly": false,
                            })
                        })
                    })
                    .collect();
                respond(&st, client_id, &request_id, 200, Some(json!({ "databases": databases })), None);
            }

            _ => respond(&st, client_id, &request_id, 400, None, Some("unknown action")),
        }
    }
}

fn response_frame(request_id: &str, status: u16, data: Option<Value>, message: Option<&str>) -> String {
    let mut response = json!({ "status": status });
    if let Some(data) = data {
        response["data"] = data;
    }
    if let Some(message) = message {
        response["message"] = json!(message);
    }
    json!({ "requestId": request_id, "response": response }).to_string()
}

fn respond(
    st: &ServerState,
    client_id: u64,
    request_id: &str,
    status: u16,
    data: Option<Value>,
    message: Option<&str>,
) {
    send_to_client(st, client_id, &response_frame(request_id, status, data, message));
}

fn send_to_client(st: &ServerState, client_id: u64, frame: &str) {
    if let Some(client) = st.clients.get(&client_id) {
        let _ = client.to_client.send(frame.to_string());
    }
}

fn push_to_client(st: &ServerState, client_id: u64, event: &Value) {
    send_to_client(st, client_id, &event.to_string());
}

fn push_to_user_except(st: &ServerState, username: &str, except: u64, event: &Value) {
    for (id, client) in &st.clients {
        if *id != except && client.username == username {
            let _ = client.to_client.send(event.to_string());
        }
    }
}

// ── Device fixtures ──────────────────────────────────────────────────────────

pub fn random_seed() -> Vec<u8> {
    let mut seed = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    seed
}

pub struct Device {
    pub store: LocalStore,
    pub store_path: PathBuf,
}

impl Device {
    /// Fresh device-local store (no seed yet).
    pub async fn fresh() -> Self {
        let store_path = PathBuf::from(format!("/tmp/sb-client-test-{}.db", Uuid::new_v4()));
        let store = LocalStore::open(&store_path).await.expect("open device store");
        Self { store, store_path }
    }

    /// Device that already holds the seed (finished sign-up here).
    pub async fn with_seed(username: &str, seed: &[u8]) -> Self {
        let device = Self::fresh().await;
        device
            .store
            .save_seed(username, &STANDARD.encode(seed))
            .await
            .expect("preload seed");
        device
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.store_path);
        let _ = std::fs::remove_file(self.store_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(self.store_path.with_extension("db-shm"));
    }
}

/// A change subscriber that streams every snapshot into a channel.
pub fn change_collector() -> (
    sb_client::ChangeHandler,
    mpsc::UnboundedReceiver<Vec<sb_client::Item>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: sb_client::ChangeHandler = Arc::new(move |items| {
        let _ = tx.send(items);
    });
    (handler, rx)
}

/// Await the first change notification satisfying `pred`.
pub async fn await_items<F>(
    rx: &mut mpsc::UnboundedReceiver<Vec<sb_client::Item>>,
    pred: F,
) -> Vec<sb_client::Item>
where
    F: Fn(&[sb_client::Item]) -> bool,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let items = rx.recv().await.expect("change stream closed");
            if pred(&items) {
                return items;
            }
        }
    })
    .await
    .expect("timed out waiting for replicated state")
}

pub fn config_for(server: &MockServer, username: &str) -> ClientConfig {
    ClientConfig::new("https://sealbase.test", "app-1", username, format!("session-{username}"))
        .with_server_public_key(server.server_public_key())
}
