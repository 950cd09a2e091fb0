//! Outbound actions and their parameter bodies.
//! These map directly to JSON bodies on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtoError;
use crate::transaction::WireOperation;

/// Every request the client can make. Serialised as the bare action string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    SignOut,
    CreateDatabase,
    GetDatabase,
    OpenDatabase,
    FindDatabases,
    Insert,
    Update,
    Delete,
    BatchTransaction,
    Bundle,
    ValidateKey,
    RequestSeed,
    GetRequestsForSeed,
    SendSeed,
    GetPublicKey,
    GrantDatabaseAccess,
    GetDatabaseAccessGrants,
    AcceptDatabaseAccess,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The serde name and the display name are the same string.
        let s = serde_json::to_value(self).expect("Action serialises to a string");
        f.write_str(s.as_str().unwrap_or("?"))
    }
}

/// Outbound envelope: `{requestId, action, params}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub request_id: String,
    pub action: Action,
    pub params: Value,
}

impl ClientRequest {
    /// Build a request with a fresh correlation id.
    pub fn new<P: Serialize>(action: Action, params: &P) -> Result<Self, ProtoError> {
        Ok(Self {
            request_id: Uuid::new_v4().to_string(),
            action,
            params: serde_json::to_value(params)?,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Parameter bodies ─────────────────────────────────────────────────────────

/// `{}` for actions that carry no parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutParams {
    pub session_id: String,
}

/// Sent when opening a database that may not exist yet; the server keeps the
/// encrypted name and wrapped key alongside the assigned `dbId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatabaseParams {
    pub encrypted_db_name: String,
    pub encrypted_db_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabaseParams {
    pub db_name_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_database_params: Option<NewDatabaseParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseParams {
    pub db_name_hash: String,
    pub encrypted_db_name: String,
    pub encrypted_db_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDatabaseParams {
    pub db_name_hash: String,
}

/// Insert / Update / Delete all submit one sealed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemParams {
    pub db_id: String,
    pub item_key: String,
    pub sealed_op: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransactionParams {
    pub db_id: String,
    pub operations: Vec<WireOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleParams {
    pub db_id: String,
    pub seq_no: u64,
    /// base64( AES-GCM( DEFLATE( bundle JSON ) ) )
    pub bundle: String,
    /// One HMAC item key per index entry, so the server can garbage-collect
    /// transactions superseded by this bundle.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyParams {
    pub validation_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSeedParams {
    pub requester_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSeedParams {
    pub requester_public_key: String,
    pub encrypted_seed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeyParams {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDatabaseAccessParams {
    pub username: String,
    pub db_id: String,
    pub encrypted_access_key: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptDatabaseAccessParams {
    pub db_id: String,
    pub encrypted_db_key: String,
    pub db_name_hash: String,
    pub encrypted_db_name: String,
}

// ── Response data bodies ─────────────────────────────────────────────────────

/// `RequestSeed` resolves with this when a paired device already answered.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SeedDelivery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_seed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRequest {
    pub requester_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SeedRequestList {
    #[serde(default)]
    pub seed_requests: Vec<SeedRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublicKey {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAccessGrant {
    pub db_id: String,
    pub grantor_public_key: String,
    pub encrypted_access_key: String,
    pub encrypted_db_name: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAccessGrantList {
    #[serde(default)]
    pub grants: Vec<DatabaseAccessGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub db_id: String,
    pub db_name_hash: String,
    pub encrypted_db_name: String,
    pub encrypted_db_key: String,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseList {
    #[serde(default)]
    pub databases: Vec<DatabaseSummary>,
}
