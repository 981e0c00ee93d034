//! Runtime-agnostic core of the account session manager.
//!
//! Everything in this crate is plain data and synchronous logic: identifiers,
//! input normalization, control-token parsing, the per-chat conversational
//! memory, and the contracts the runtime crate plugs implementations into
//! (credential storage, sealing, HTTP, completions).

pub mod auth;
pub mod command;
pub mod completion;
pub mod conversation;
pub mod crypto;
pub mod net;
pub mod store;
pub mod types;

pub use types::*;
