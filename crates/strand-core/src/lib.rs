//! strand-core — identities, wire format, cryptographic primitives,
//! contexts and configuration. All other Strand crates depend on this one.

pub mod config;
pub mod context;
pub mod crypto;
pub mod identity;
pub mod wire;

pub use context::{CancelHandle, Context, ContextError};
pub use identity::{new_nonce, Endpoint, Identity, Nonce};
pub use wire::Frame;
