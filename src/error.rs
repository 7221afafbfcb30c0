//! Error types for the lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.
//!
//! Protocol violations are deliberately absent: a request that breaks the
//! protocol rules is dropped by its processor and never becomes an error
//! value. Per-IA failures are reported to the client as status codes.

use std::net::IpAddr;
use std::time::Duration;

/// Errors that can occur while building or operating the lease engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and while
    /// building links and pools. A server refuses to activate a link or pool
    /// that produces this error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An address range could not be parsed or is inverted.
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    /// An address or identifier could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The lease store already holds this address for a different IA.
    #[error("Address {0} is already bound to another client")]
    DuplicateAddress(IpAddr),

    /// The lease store failed to complete an operation.
    #[error("Lease store error: {0}")]
    Store(String),

    /// A lease store operation did not finish within the configured timeout.
    #[error("Lease store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    /// No binding exists for the given IA.
    #[error("Binding {0} not found")]
    BindingNotFound(String),

    /// A dynamic DNS update failed.
    ///
    /// These are logged by the binding managers and never abort a lease
    /// transition.
    #[error("DDNS update failed: {0}")]
    Ddns(String),
}

/// A specialized Result type for lease engine operations.
pub type Result<T> = std::result::Result<T, Error>;
