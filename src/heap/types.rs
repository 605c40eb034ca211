//! Registry configuration and the values it hands out.

use crate::conflate::ConflationStrategy;
use crate::types::{Sequence, SessionId, SubscriptionId, Timestamp};
use crate::wire::CloseReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for a [`HeapRegistry`](super::HeapRegistry).
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Pending deltas per subscription before the backlog is conflated.
    /// Default: 16
    pub max_backlog_depth: usize,

    /// How a backlog is conflated.
    /// Default: `ConflationStrategy::Simple`
    pub conflation: ConflationStrategy,

    /// Allow a session to hold several subscriptions to the same heap.
    /// Default: false
    pub allow_duplicate_subscriptions: bool,

    /// How many torn-down session ids to remember for rejecting late subscribes.
    /// Default: 4096
    pub tombstone_capacity: usize,

    /// Buffered termination notices; the oldest is evicted when full.
    /// Default: 1024
    pub notice_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_backlog_depth: 16,
            conflation: ConflationStrategy::Simple,
            allow_duplicate_subscriptions: false,
            tombstone_capacity: 4096,
            notice_buffer: 1024,
        }
    }
}

/// A session's registered interest in one heap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub session: SessionId,
    pub heap_uri: String,
    pub created_at: Timestamp,
}

/// Emitted once for every subscription that ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationNotice {
    pub subscription_id: SubscriptionId,
    pub session: SessionId,
    pub heap_uri: String,
    pub reason: CloseReason,
    pub at: Timestamp,
}

/// Read-only monitoring view of one heap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSnapshot {
    pub uri: String,
    pub last_update_id: Sequence,
    pub subscription_count: usize,
    /// Subscription ids grouped by owning session.
    pub subscriptions_by_session: BTreeMap<SessionId, Vec<SubscriptionId>>,
}
