//! Core error taxonomy.
//!
//! Every per-session failure is caught at the session boundary and mapped to
//! one of these kinds before it is logged and the session is torn down.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds the core recognizes. Each variant's `Display` is safe to log
/// as-is; none of them ever carry key material or decrypted plaintext.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wire framing, CRC, unknown type, out-of-state packet, size-limit breach.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// AEAD failure, nonce reuse, auth mismatch, encryption-required violation,
    /// client key not in allow-list. Never formatted with key material.
    #[error("security error: {0}")]
    Security(String),

    /// Buffer-pool allocation failure, frame buffer overflow, socket allocation
    /// failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Peer closed the connection or timed out.
    #[error("peer error: {0}")]
    Peer(String),

    /// Malformed key material, unknown palette, unresolvable hostname.
    /// Surfaced only at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Invariant violation. Considered a bug; the caller should treat this as
    /// fatal to the process (see [`CoreError::abort_on_internal`]).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        CoreError::Protocol(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        CoreError::Security(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        CoreError::Resource(msg.into())
    }

    pub fn peer(msg: impl Into<String>) -> Self {
        CoreError::Peer(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }

    /// A short, stable tag for log filtering/metrics, independent of the
    /// (potentially detailed) Display message.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Protocol(_) => "protocol",
            CoreError::Security(_) => "security",
            CoreError::Resource(_) => "resource",
            CoreError::Peer(_) => "peer",
            CoreError::Config(_) => "config",
            CoreError::Internal(_) => "internal",
        }
    }

    /// §7: "InternalError is considered a bug and terminates the process
    /// with a diagnostic." Call sites that detect an invariant violation
    /// should log then call this rather than try to continue. Panicking
    /// (rather than `std::process::abort`) keeps the failure testable with
    /// `#[should_panic]` in debug builds; operators run release builds with
    /// `panic = "abort"` so the end result is still full process
    /// termination.
    pub fn abort_on_internal(&self) -> ! {
        tracing::error!(kind = "internal", error = %self, "invariant violation");
        panic!("internal error: {self}");
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Peer(e.to_string())
    }
}
