//! Client-side heap replicas kept current from pushed deltas.

use super::delta::{apply_block, DeltaBlock};
use crate::error::{LinkError, Result};
use crate::session::{Session, SessionListener};
use crate::types::{Sequence, SessionId, SubscriptionId};
use crate::wire::{CloseReason, Frame};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Local copy of one subscribed heap.
#[derive(Clone, Debug, PartialEq)]
pub struct Replica {
    pub subscription_id: SubscriptionId,
    pub session: SessionId,
    pub heap_uri: String,
    /// Sequence the state reflects.
    pub sequence: Sequence,
    pub state: Value,
}

/// A replica ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaNotice {
    pub subscription_id: SubscriptionId,
    pub heap_uri: String,
    pub reason: CloseReason,
}

struct PendingRequest {
    session: SessionId,
    reply: Sender<Result<SubscriptionId>>,
}

#[derive(Default)]
struct ReplicaState {
    replicas: HashMap<SubscriptionId, Replica>,
    pending: HashMap<u64, PendingRequest>,
}

/// Subscriber-side view of every heap subscribed through a pool.
///
/// Register it as a pool listener; it consumes `Subscribed`, `Delta` and
/// `Terminated` frames and ends replicas when their session is suspended,
/// told to disconnect, or lost. A delta that does not continue a replica's
/// sequence is a protocol violation and closes the session.
pub struct ReplicaSet {
    state: Mutex<ReplicaState>,
    next_request: AtomicU64,
    notices_tx: Sender<ReplicaNotice>,
    notices_rx: Receiver<ReplicaNotice>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        let (notices_tx, notices_rx) = unbounded();
        Self {
            state: Mutex::new(ReplicaState::default()),
            next_request: AtomicU64::new(1),
            notices_tx,
            notices_rx,
        }
    }

    /// Ask the server for a heap and wait for its snapshot.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        heap_uri: &str,
        timeout: Duration,
    ) -> Result<SubscriptionId> {
        if !session.is_available() {
            return Err(LinkError::SessionUnavailable(session.id()));
        }

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        self.state.lock().pending.insert(
            request_id,
            PendingRequest {
                session: session.id(),
                reply: tx,
            },
        );

        let sent = session.send(Frame::Subscribe {
            request_id,
            heap_uri: heap_uri.to_string(),
        });
        if let Err(e) = sent {
            self.state.lock().pending.remove(&request_id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.state.lock().pending.remove(&request_id);
                Err(LinkError::Timeout(format!("subscription to {}", heap_uri)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::SessionClosed(session.id())),
        }
    }

    /// Drop a replica and tell the server. Returns false if it was already gone.
    pub fn unsubscribe(&self, session: &Session, subscription_id: SubscriptionId) -> Result<bool> {
        let removed = self.state.lock().replicas.remove(&subscription_id);
        let Some(replica) = removed else {
            return Ok(false);
        };
        self.notify(&replica, CloseReason::RequestedBySubscriber);
        session.send(Frame::Unsubscribe { subscription_id })?;
        Ok(true)
    }

    pub fn replica(&self, subscription_id: SubscriptionId) -> Option<Replica> {
        self.state.lock().replicas.get(&subscription_id).cloned()
    }

    /// Sequence and state of a replica.
    pub fn state_of(&self, subscription_id: SubscriptionId) -> Option<(Sequence, Value)> {
        self.state
            .lock()
            .replicas
            .get(&subscription_id)
            .map(|r| (r.sequence, r.state.clone()))
    }

    pub fn replicas_for(&self, session: SessionId) -> Vec<Replica> {
        self.state
            .lock()
            .replicas
            .values()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notices(&self) -> Receiver<ReplicaNotice> {
        self.notices_rx.clone()
    }

    fn notify(&self, replica: &Replica, reason: CloseReason) {
        debug!(subscription = %replica.subscription_id, heap = %replica.heap_uri, reason = %reason, "Replica ended");
        let _ = self.notices_tx.send(ReplicaNotice {
            subscription_id: replica.subscription_id,
            heap_uri: replica.heap_uri.clone(),
            reason,
        });
    }

    fn end_session(&self, session: SessionId, reason: CloseReason) -> usize {
        let ended: Vec<Replica> = {
            let mut state = self.state.lock();
            let ids: Vec<SubscriptionId> = state
                .replicas
                .values()
                .filter(|r| r.session == session)
                .map(|r| r.subscription_id)
                .collect();
            ids.iter()
                .filter_map(|id| state.replicas.remove(id))
                .collect()
        };
        for replica in &ended {
            self.notify(replica, reason);
        }
        ended.len()
    }

    fn apply_delta(
        &self,
        session: SessionId,
        subscription_id: SubscriptionId,
        block: &DeltaBlock,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(replica) = state.replicas.get_mut(&subscription_id) else {
            // Already unsubscribed locally.
            return Ok(());
        };
        if replica.session != session {
            return Err(LinkError::ProtocolViolation(format!(
                "delta for subscription {} on the wrong session",
                subscription_id
            )));
        }
        if block.from != replica.sequence || block.to <= block.from {
            return Err(LinkError::ProtocolViolation(format!(
                "delta {:?}..{:?} does not continue {:?} for subscription {}",
                block.from, block.to, replica.sequence, subscription_id
            )));
        }
        apply_block(&mut replica.state, block);
        replica.sequence = block.to;
        Ok(())
    }
}

impl Default for ReplicaSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionListener for ReplicaSet {
    fn on_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Subscribed {
                request_id,
                subscription_id,
                heap_uri,
                sequence,
                snapshot,
            } => {
                let mut state = self.state.lock();
                let pending = state.pending.remove(&request_id);
                if request_id != 0 && pending.is_none() {
                    // The caller already gave up on this request.
                    drop(state);
                    debug!(subscription = %subscription_id, heap = %heap_uri, request = request_id, "Late subscription reply, unsubscribing");
                    return session.send(Frame::Unsubscribe { subscription_id });
                }
                state.replicas.insert(
                    subscription_id,
                    Replica {
                        subscription_id,
                        session: session.id(),
                        heap_uri,
                        sequence,
                        state: snapshot,
                    },
                );
                if let Some(pending) = pending {
                    let _ = pending.reply.send(Ok(subscription_id));
                }
                Ok(())
            }
            Frame::SubscribeFailed { request_id, reason } => {
                if let Some(pending) = self.state.lock().pending.remove(&request_id) {
                    let _ = pending.reply.send(Err(LinkError::SubscriptionRejected(reason)));
                }
                Ok(())
            }
            Frame::Delta {
                subscription_id,
                block,
                ..
            } => self.apply_delta(session.id(), subscription_id, &block),
            Frame::Terminated {
                subscription_id,
                reason,
            } => {
                let removed = self.state.lock().replicas.remove(&subscription_id);
                if let Some(replica) = removed {
                    self.notify(&replica, reason);
                }
                Ok(())
            }
            Frame::Suspend => {
                self.end_session(session.id(), CloseReason::SuspendReceived);
                Ok(())
            }
            Frame::Disconnect => {
                self.end_session(session.id(), CloseReason::DisconnectReceived);
                Ok(())
            }
            other => Err(LinkError::ProtocolViolation(format!(
                "unexpected {} frame",
                other.kind()
            ))),
        }
    }

    fn on_session_closed(&self, session: &Arc<Session>) {
        let ended = self.end_session(session.id(), CloseReason::ConnectionLost);
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|_, p| p.session != session.id());
        let abandoned = before - state.pending.len();
        if ended > 0 || abandoned > 0 {
            warn!(session = %session.id(), replicas = ended, requests = abandoned, "Session lost");
        }
    }
}
