//! Frame definitions.

use crate::heap::DeltaBlock;
use crate::types::{Sequence, SessionId, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Why a subscription (or the session carrying it) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// The subscriber asked to stop.
    RequestedBySubscriber,
    /// An administrator on the publishing side ended it.
    RequestedByPublisherAdministrator,
    /// The owning session closed.
    ConnectionLost,
    /// The remote suspended the session.
    SuspendReceived,
    /// The remote announced it is about to disconnect.
    DisconnectReceived,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::RequestedBySubscriber => "REQUESTED_BY_SUBSCRIBER",
            CloseReason::RequestedByPublisherAdministrator => {
                "REQUESTED_BY_PUBLISHER_ADMINISTRATOR"
            }
            CloseReason::ConnectionLost => "CONNECTION_LOST",
            CloseReason::SuspendReceived => "SUSPEND_RECEIVED",
            CloseReason::DisconnectReceived => "DISCONNECT_RECEIVED",
        };
        f.write_str(name)
    }
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // --- Handshake ---
    /// First frame sent by the connecting side.
    Hello {
        version: u32,
        identity: BTreeMap<String, String>,
    },
    /// Handshake accepted.
    Welcome { version: u32, session_id: SessionId },
    /// Handshake refused; the connection will be closed.
    Rejected { reason: String },

    // --- Session control ---
    /// Stop issuing new work on this session without closing it.
    Suspend,
    /// The remote intends to close the session soon.
    Disconnect,

    // --- Heap protocol ---
    Subscribe { request_id: u64, heap_uri: String },
    /// Subscription accepted, with the heap state at `sequence`.
    Subscribed {
        request_id: u64,
        subscription_id: SubscriptionId,
        heap_uri: String,
        sequence: Sequence,
        snapshot: serde_json::Value,
    },
    SubscribeFailed { request_id: u64, reason: String },
    Delta {
        subscription_id: SubscriptionId,
        heap_uri: String,
        block: DeltaBlock,
    },
    Unsubscribe { subscription_id: SubscriptionId },
    Terminated {
        subscription_id: SubscriptionId,
        reason: CloseReason,
    },
}

impl Frame {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Rejected { .. } => "rejected",
            Frame::Suspend => "suspend",
            Frame::Disconnect => "disconnect",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Subscribed { .. } => "subscribed",
            Frame::SubscribeFailed { .. } => "subscribe_failed",
            Frame::Delta { .. } => "delta",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Terminated { .. } => "terminated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_wire_names() {
        let json = serde_json::to_string(&CloseReason::RequestedByPublisherAdministrator).unwrap();
        assert_eq!(json, "\"REQUESTED_BY_PUBLISHER_ADMINISTRATOR\"");
        assert_eq!(CloseReason::ConnectionLost.to_string(), "CONNECTION_LOST");
    }
}
