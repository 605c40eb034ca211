//! Session health state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in its life.
///
/// Transitions only move forward:
/// `Handshaking -> Active -> Suspended -> Disconnecting -> Closing -> Closed`,
/// with any state allowed to jump straight to `Closing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport connected, handshake not yet resolved.
    Handshaking,
    /// Connected and usable for new work.
    Active,
    /// Remote sent `Suspend`: no new work, but the session stays open.
    Suspended,
    /// Remote sent `Disconnect`: it will close the session soon.
    Disconnecting,
    /// Local close in progress.
    Closing,
    Closed,
}

impl SessionState {
    /// connected ∧ ¬closing ∧ ¬SUSPEND ∧ ¬DISCONNECT
    pub fn is_available(self) -> bool {
        self == SessionState::Active
    }

    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub(crate) fn on_handshake_accepted(self) -> Self {
        match self {
            SessionState::Handshaking => SessionState::Active,
            other => other,
        }
    }

    pub(crate) fn on_suspend(self) -> Self {
        self.max(SessionState::Suspended)
    }

    pub(crate) fn on_disconnect(self) -> Self {
        self.max(SessionState::Disconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
