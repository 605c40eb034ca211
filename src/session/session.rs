//! A live connection to one endpoint.

use super::handshake::{HandshakeCoordinator, HandshakeOutcome};
use super::outbound::OutboundQueue;
use super::state::SessionState;
use super::SessionListener;
use crate::conflate::Conflater;
use crate::error::{LinkError, Result};
use crate::heap::DeltaBlock;
use crate::transport::Link;
use crate::types::{Endpoint, SessionId, SubscriptionId, Timestamp};
use crate::wire::Frame;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the handshake a session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Sends `Hello`, receives `Welcome` and control frames.
    Client,
    /// Receives `Hello`, sends `Welcome` and control frames.
    Server,
}

/// One bidirectional connection plus its health state and outbound queue.
///
/// A started session runs two threads: a dispatcher that feeds inbound frames
/// to its [`SessionListener`] and a writer that drains the [`OutboundQueue`]
/// into the link. The dispatcher owns teardown and reports the close to the
/// listener exactly once.
pub struct Session {
    id: SessionId,
    endpoint: Endpoint,
    role: SessionRole,
    state: Mutex<SessionState>,
    remote_id: Mutex<Option<SessionId>>,
    handshake: HandshakeCoordinator,
    outbound: OutboundQueue,
    link: Box<dyn Link>,
    opened_at: Timestamp,
    started: AtomicBool,
    close_signal: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl Session {
    pub fn new(endpoint: Endpoint, role: SessionRole, link: Box<dyn Link>) -> Arc<Self> {
        let (tx, rx) = bounded(0);
        Arc::new(Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst)),
            endpoint,
            role,
            state: Mutex::new(SessionState::Handshaking),
            remote_id: Mutex::new(None),
            handshake: HandshakeCoordinator::new(),
            outbound: OutboundQueue::new(),
            link,
            opened_at: Timestamp::now(),
            started: AtomicBool::new(false),
            close_signal: Mutex::new(Some(tx)),
            closed: rx,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Whether new outbound work may be issued on this session.
    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closing()
    }

    /// The id the remote assigned to this session during the handshake.
    pub fn remote_id(&self) -> Option<SessionId> {
        *self.remote_id.lock()
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn handshake(&self) -> &HandshakeCoordinator {
        &self.handshake
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Record a successful handshake. Has no effect once the session moved on.
    pub fn mark_active(&self, remote_id: SessionId) {
        *self.remote_id.lock() = Some(remote_id);
        let mut state = self.state.lock();
        *state = state.on_handshake_accepted();
    }

    /// Apply a `Suspend` or `Disconnect` control frame to the session state.
    pub fn apply_control(&self, frame: &Frame) {
        let mut state = self.state.lock();
        let next = match frame {
            Frame::Suspend => state.on_suspend(),
            Frame::Disconnect => state.on_disconnect(),
            _ => return,
        };
        if next != *state {
            debug!(session = %self.id, from = %*state, to = %next, "Session state changed");
            *state = next;
        }
    }

    /// Queue a frame for the writer thread.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() || !self.outbound.push(frame) {
            return Err(LinkError::SessionClosed(self.id));
        }
        Ok(())
    }

    /// Write a frame on the caller's thread, bypassing the queue.
    pub fn send_direct(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::SessionClosed(self.id));
        }
        self.link.send(frame)
    }

    /// Queue a delta, conflating this subscription's backlog past `max_depth`.
    pub fn send_delta(
        &self,
        subscription_id: SubscriptionId,
        heap_uri: &str,
        block: DeltaBlock,
        max_depth: usize,
        conflater: Option<&dyn Conflater>,
    ) -> Result<()> {
        if self.is_closed()
            || !self
                .outbound
                .push_delta(subscription_id, heap_uri, block, max_depth, conflater)?
        {
            return Err(LinkError::SessionClosed(self.id));
        }
        Ok(())
    }

    /// Close the session. Returns false if it was already closing.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_closing() {
                return false;
            }
            *state = if self.started.load(Ordering::SeqCst) {
                SessionState::Closing
            } else {
                SessionState::Closed
            };
        }
        debug!(session = %self.id, endpoint = %self.endpoint, "Closing session");
        self.handshake.abandon();
        self.outbound.close();
        self.link.close();
        self.close_signal.lock().take();
        true
    }

    /// Spawn the dispatcher and writer threads.
    pub fn start(
        self: &Arc<Self>,
        inbound: Receiver<Frame>,
        listener: Arc<dyn SessionListener>,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let writer = Arc::clone(self);
        thread::Builder::new()
            .name(format!("heaplink-writer-{}", self.id))
            .spawn(move || writer.write_loop())?;

        let dispatcher = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("heaplink-session-{}", self.id))
            .spawn(move || dispatcher.dispatch_loop(inbound, listener));
        if let Err(e) = spawned {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    fn write_loop(self: Arc<Self>) {
        while let Some(frame) = self.outbound.pop() {
            if let Err(e) = self.link.send(&frame) {
                debug!(session = %self.id, error = %e, "Write failed, closing session");
                self.close();
                break;
            }
        }
    }

    fn dispatch_loop(self: Arc<Self>, inbound: Receiver<Frame>, listener: Arc<dyn SessionListener>) {
        let closed = self.closed.clone();
        loop {
            select! {
                recv(inbound) -> msg => match msg {
                    Ok(frame) => {
                        if let Err(e) = self.handle_inbound(frame, listener.as_ref()) {
                            warn!(
                                session = %self.id,
                                endpoint = %self.endpoint,
                                error = %e,
                                "Closing session after protocol error"
                            );
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(session = %self.id, endpoint = %self.endpoint, "Inbound stream ended");
                        break;
                    }
                },
                recv(closed) -> _ => break,
            }
        }

        self.close();
        *self.state.lock() = SessionState::Closed;
        listener.on_session_closed(&self);
    }

    fn handle_inbound(self: &Arc<Self>, frame: Frame, listener: &dyn SessionListener) -> Result<()> {
        match (self.role, frame) {
            (SessionRole::Client, Frame::Welcome { version, session_id }) => {
                let accepted = self.handshake.complete(HandshakeOutcome::Accepted {
                    version,
                    remote_id: session_id,
                });
                if !accepted {
                    return Err(LinkError::ProtocolViolation(
                        "welcome after handshake resolved".to_string(),
                    ));
                }
                Ok(())
            }
            (SessionRole::Client, Frame::Rejected { reason }) => {
                if !self
                    .handshake
                    .complete(HandshakeOutcome::Rejected(reason))
                {
                    return Err(LinkError::ProtocolViolation(
                        "rejected after handshake resolved".to_string(),
                    ));
                }
                Ok(())
            }
            (SessionRole::Client, frame @ (Frame::Suspend | Frame::Disconnect)) => {
                self.apply_control(&frame);
                listener.on_frame(self, frame)
            }
            (
                SessionRole::Server,
                frame @ (Frame::Welcome { .. }
                | Frame::Rejected { .. }
                | Frame::Suspend
                | Frame::Disconnect),
            ) => Err(LinkError::ProtocolViolation(format!(
                "{} sent to a server session",
                frame.kind()
            ))),
            (_, frame) => listener.on_frame(self, frame),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
