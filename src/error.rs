//! Error types for sessions, pooling and heap replication.

use crate::types::{Endpoint, Sequence, SessionId, SubscriptionId};
use thiserror::Error;

/// Main error type for heaplink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect to {endpoint} failed: {reason}")]
    Connect { endpoint: Endpoint, reason: String },

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(Endpoint),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Session teardown already started: {0}")]
    SessionTornDown(SessionId),

    #[error("Session not available for new work: {0}")]
    SessionUnavailable(SessionId),

    #[error("No session available")]
    NoSessionAvailable,

    #[error("Heap not found: {0}")]
    HeapNotFound(String),

    #[error("Heap already exists: {0}")]
    HeapExists(String),

    #[error("Subscription already active for session {session} on heap {heap}")]
    SubscriptionActive { session: SessionId, heap: String },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("Invalid sequence: {0:?} (head is {1:?})")]
    InvalidSequence(Sequence, Sequence),

    #[error("Delta blocks are not contiguous: {previous:?} then {next:?}")]
    NonContiguousDeltas { previous: Sequence, next: Sequence },

    #[error("Conflation is disabled")]
    ConflationDisabled,

    #[error("Cannot conflate an empty run of blocks")]
    EmptyConflation,

    #[error("Unknown conflater: {0}")]
    UnknownConflater(String),

    #[error("Endpoint resolution failed: {0}")]
    Resolve(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),
}

impl LinkError {
    /// Whether the error is a transient network condition that the pool
    /// recovers from by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_)
                | LinkError::Connect { .. }
                | LinkError::HandshakeTimeout(_)
                | LinkError::HandshakeRejected(_)
                | LinkError::SessionClosed(_)
        )
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for LinkError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LinkError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LinkError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LinkError::Deserialization(e.to_string())
    }
}

/// Result type for heaplink operations.
pub type Result<T> = std::result::Result<T, LinkError>;
