//! Diagnostic views of a pool.

use crate::session::SessionState;
use crate::types::{Endpoint, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

/// One live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub endpoint: Endpoint,
    pub session: SessionId,
    pub state: SessionState,
    pub opened_at: Timestamp,
}

/// One endpoint waiting on a reconnect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStatus {
    pub endpoint: Endpoint,
    /// Failed attempts so far.
    pub attempt: u32,
}

/// Point-in-time view of a pool, in endpoint order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub running: bool,
    pub sessions: Vec<SessionStatus>,
    pub pending: Vec<PendingStatus>,
}

impl PoolSnapshot {
    /// Number of sessions currently available for new work.
    pub fn available(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state.is_available())
            .count()
    }
}
