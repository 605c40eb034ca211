//! Handshake coordination.

use crate::error::{LinkError, Result};
use crate::types::{Endpoint, SessionId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::time::Duration;

/// How a handshake ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted { version: u32, remote_id: SessionId },
    Rejected(String),
}

/// One-shot rendezvous between the thread that connected a session and the
/// dispatcher that sees the remote's handshake reply.
///
/// The sender half is the session's "handshake pending" marker; it is taken
/// (cleared) by the first [`complete`](Self::complete).
pub struct HandshakeCoordinator {
    pending: Mutex<Option<Sender<HandshakeOutcome>>>,
    result: Receiver<HandshakeOutcome>,
}

impl HandshakeCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            pending: Mutex::new(Some(tx)),
            result: rx,
        }
    }

    /// Resolve the handshake. Later calls are ignored and return false.
    pub fn complete(&self, outcome: HandshakeOutcome) -> bool {
        match self.pending.lock().take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Abandon the handshake without an outcome; a waiter sees the session as closed.
    pub fn abandon(&self) {
        self.pending.lock().take();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Block until the handshake resolves or `timeout` elapses.
    pub fn wait(
        &self,
        endpoint: &Endpoint,
        session: SessionId,
        timeout: Duration,
    ) -> Result<(u32, SessionId)> {
        match self.result.recv_timeout(timeout) {
            Ok(HandshakeOutcome::Accepted { version, remote_id }) => Ok((version, remote_id)),
            Ok(HandshakeOutcome::Rejected(reason)) => Err(LinkError::HandshakeRejected(reason)),
            Err(RecvTimeoutError::Timeout) => {
                self.abandon();
                Err(LinkError::HandshakeTimeout(endpoint.clone()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::SessionClosed(session)),
        }
    }
}

impl Default for HandshakeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
