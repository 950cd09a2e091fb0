//! sb_client — the Sealbase client core
//!
//! One [`Client`] per signed-in user; [`Client::connect`] yields a live
//! [`Connection`] that owns the WebSocket session, correlates requests with
//! responses, replays the server's encrypted transaction log into in-memory
//! [`database::Database`] replicas, and runs the seed-pairing and
//! access-grant handshakes.
//!
//! The server is untrusted: it orders and stores ciphertext but never holds
//! a key. Everything it indexes by (database names, item ids) reaches it
//! only as HMAC tags.
//!
//! # Modules
//! - `config`     — server endpoint + identity configuration
//! - `keys`       — seed-derived key set (encryption / DH / HMAC)
//! - `transport`  — transport abstraction + the WebSocket implementation
//! - `connection` — state machine, request multiplexer, event router
//! - `database`   — per-database replica engine
//! - `access`     — grants, seed send/receive, injected UI capabilities
//! - `error`      — unified error type

pub mod access;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod keys;
pub mod transport;

pub use access::UiCallbacks;
pub use config::ClientConfig;
pub use connection::{Client, Connection, DatabaseInfo};
pub use database::{ChangeHandler, Item};
pub use error::ClientError;
pub use sb_proto::transaction::Operation;
