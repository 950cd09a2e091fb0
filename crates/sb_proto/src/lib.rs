//! sb_proto — Wire types and serialisation for the Sealbase client core
//!
//! Both directions of the channel speak JSON with camelCase field names.
//! Outbound: `{requestId, action, params}`. Inbound: either a correlated
//! response `{requestId, response: {status, data?, message?}}` or a
//! server-pushed event `{route, ...}`.
//!
//! # Modules
//! - `action`      — outbound actions and their parameter bodies
//! - `event`       — inbound responses + server-pushed events (closed sum)
//! - `transaction` — encrypted transaction-log entries and their sealed ops
//! - `bundle`      — database snapshot payload (DEFLATE + AES-GCM + base64)

pub mod action;
pub mod bundle;
pub mod error;
pub mod event;
pub mod transaction;

pub use action::{Action, ClientRequest};
pub use error::ProtoError;
pub use event::{InboundMessage, Response, ServerEvent};
