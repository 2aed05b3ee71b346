//! Crate-wide error taxonomy
//!
//! Every public fallible operation returns `Result<T, MeshError>`.
//! Transient network failures (handshake/ack timeouts) are retried internally
//! before surfacing; integrity failures are never retried automatically.

/// Errors surfaced by the StateMesh core
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Handshake timed out against node {0}")]
    HandshakeTimeout(String),

    #[error("Handshake rejected by node {node}: {reason}")]
    HandshakeRejected { node: String, reason: String },

    #[error("Fragment checksum mismatch: {0}")]
    FragmentChecksumMismatch(String),

    #[error("Incomplete fragment set: {0}")]
    IncompleteFragmentSet(String),

    #[error("Integrity violation for state {0}")]
    IntegrityViolation(String),

    #[error("Storage exhausted: need {needed} bytes, {available} available")]
    StorageExhausted { needed: u64, available: u64 },

    #[error("Concurrent modification of state {0} rejected")]
    ConcurrentModification(String),

    #[error("No migration path from format v{from} to v{to}")]
    UnsupportedFormatVersion { from: u32, to: u32 },

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Session expired for node {0}")]
    SessionExpired(String),

    #[error("Session not established: {0}")]
    SessionNotEstablished(String),

    #[error("No eligible node remains for fragment {0}")]
    NoEligibleNode(usize),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
