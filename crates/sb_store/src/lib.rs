//! sb_store — durable device-local state for the Sealbase client
//!
//! Holds the small set of per-username artifacts that must outlive a
//! connection: the account seed (base64), the ephemeral seed-request
//! keypair, and the server session id. Everything is an opaque blob to this
//! crate; only the connection layer reads or writes it.
//!
//! The seed is stored in plaintext on the device, matching the trust model:
//! whoever controls the device IS the user. What the seed protects is the
//! server's view, not the device's.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::LocalStore;
