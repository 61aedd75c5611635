//! Shared domain types for the Confab runtime.
//!
//! Everything here is plain data: no I/O, no async. The store, provider,
//! asset, and runtime crates all build on these types.

pub mod agent;
pub mod chat;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod message;
pub mod namespace;
pub mod routing;
pub mod stream;
pub mod thread;

pub use error::{Error, ErrorCategory, Result};

/// Generate a new ULID string (lexicographically sortable, millisecond
/// precision, monotonic tie-break within a process).
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Generate a random opaque id (worker ids, tool call ids).
pub fn new_opaque_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
