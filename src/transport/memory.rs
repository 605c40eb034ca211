//! In-process transport for tests and benchmarks.
//!
//! Each endpoint is scripted: refuse some number of connects, then accept and
//! answer the handshake with a chosen reply. Every accepted connection gets a
//! [`MemoryPeer`] handle that plays the remote side.
//!
//! # Example
//!
//! ```ignore
//! let transport = MemoryTransport::new();
//! transport.accept_after("a:1", 3);
//!
//! // ... run a pool against `transport` ...
//!
//! let peer = transport.peer(&"a:1".into()).unwrap();
//! peer.inject(Frame::Suspend);
//! ```

use super::{Connected, Link, Transport};
use crate::error::{LinkError, Result};
use crate::types::{Endpoint, SessionId};
use crate::wire::{Frame, PROTOCOL_VERSION};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the remote answers a `Hello`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeReply {
    Welcome,
    Reject(String),
    /// Never answer, forcing a handshake timeout.
    Silent,
}

#[derive(Clone, Debug)]
struct Script {
    refusals_remaining: u32,
    accepting: bool,
    reply: HandshakeReply,
}

struct PeerShared {
    remote_id: SessionId,
    reply: HandshakeReply,
    to_local: Mutex<Option<Sender<Frame>>>,
    sent: Mutex<Vec<Frame>>,
    closed: AtomicBool,
}

impl PeerShared {
    fn deliver(&self, frame: Frame) -> bool {
        match self.to_local.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.to_local.lock().take();
    }
}

/// Local half of an in-process connection.
struct MemoryLink {
    shared: Arc<PeerShared>,
}

impl Link for MemoryLink {
    fn send(&self, frame: &Frame) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory link closed",
            )));
        }
        self.shared.sent.lock().push(frame.clone());

        if let Frame::Hello { .. } = frame {
            match &self.shared.reply {
                HandshakeReply::Welcome => {
                    self.shared.deliver(Frame::Welcome {
                        version: PROTOCOL_VERSION,
                        session_id: self.shared.remote_id,
                    });
                }
                HandshakeReply::Reject(reason) => {
                    self.shared.deliver(Frame::Rejected {
                        reason: reason.clone(),
                    });
                }
                HandshakeReply::Silent => {}
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.shared.shut();
    }
}

/// Remote side of an in-process connection.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
}

impl MemoryPeer {
    /// Deliver a frame to the local side. Returns false once closed.
    pub fn inject(&self, frame: Frame) -> bool {
        self.shared.deliver(frame)
    }

    /// Frames the local side has sent so far.
    pub fn sent(&self) -> Vec<Frame> {
        self.shared.sent.lock().clone()
    }

    /// Wait until the local side has sent a frame matching `pred`.
    pub fn wait_for_sent<F>(&self, timeout: Duration, pred: F) -> Option<Frame>
    where
        F: Fn(&Frame) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.sent().into_iter().find(|f| pred(f)) {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Simulate the remote dropping the connection.
    pub fn drop_connection(&self) {
        self.shared.shut();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

static NEXT_REMOTE_ID: AtomicU64 = AtomicU64::new(1_000_000);

fn new_pair(reply: HandshakeReply) -> (Connected, MemoryPeer) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(PeerShared {
        remote_id: SessionId(NEXT_REMOTE_ID.fetch_add(1, Ordering::SeqCst)),
        reply,
        to_local: Mutex::new(Some(tx)),
        sent: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });
    let connected = Connected {
        link: Box::new(MemoryLink {
            shared: Arc::clone(&shared),
        }),
        inbound: rx,
    };
    (connected, MemoryPeer { shared })
}

/// A connected pair outside of any transport; the peer welcomes any `Hello`.
pub fn loopback() -> (Connected, MemoryPeer) {
    new_pair(HandshakeReply::Welcome)
}

/// Scripted in-process transport. Unknown endpoints refuse connections.
pub struct MemoryTransport {
    scripts: Mutex<HashMap<Endpoint, Script>>,
    attempts: Mutex<HashMap<Endpoint, Vec<Instant>>>,
    peers: Mutex<HashMap<Endpoint, Vec<MemoryPeer>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, endpoint: Endpoint, script: Script) {
        self.scripts.lock().insert(endpoint, script);
    }

    /// Accept every connect and welcome the handshake.
    pub fn accept(&self, endpoint: impl Into<Endpoint>) {
        self.accept_after(endpoint, 0);
    }

    /// Refuse the next `refusals` connects, then accept.
    pub fn accept_after(&self, endpoint: impl Into<Endpoint>, refusals: u32) {
        self.script(
            endpoint.into(),
            Script {
                refusals_remaining: refusals,
                accepting: true,
                reply: HandshakeReply::Welcome,
            },
        );
    }

    /// Accept connects but answer the handshake with `reply`.
    pub fn reply_with(&self, endpoint: impl Into<Endpoint>, reply: HandshakeReply) {
        self.script(
            endpoint.into(),
            Script {
                refusals_remaining: 0,
                accepting: true,
                reply,
            },
        );
    }

    /// Refuse every connect.
    pub fn refuse(&self, endpoint: impl Into<Endpoint>) {
        self.script(
            endpoint.into(),
            Script {
                refusals_remaining: 0,
                accepting: false,
                reply: HandshakeReply::Welcome,
            },
        );
    }

    /// When each connect to `endpoint` was attempted.
    pub fn attempts(&self, endpoint: &Endpoint) -> Vec<Instant> {
        self.attempts.lock().get(endpoint).cloned().unwrap_or_default()
    }

    /// The most recent accepted connection to `endpoint`.
    pub fn peer(&self, endpoint: &Endpoint) -> Option<MemoryPeer> {
        self.peers
            .lock()
            .get(endpoint)
            .and_then(|peers| peers.last().cloned())
    }

    /// Number of accepted connections to `endpoint` so far.
    pub fn connection_count(&self, endpoint: &Endpoint) -> usize {
        self.peers.lock().get(endpoint).map_or(0, Vec::len)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Connected> {
        self.attempts
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .push(Instant::now());

        let reply = {
            let mut scripts = self.scripts.lock();
            let accepted = match scripts.get_mut(endpoint) {
                Some(script) if script.refusals_remaining > 0 => {
                    script.refusals_remaining -= 1;
                    None
                }
                Some(script) if script.accepting => Some(script.reply.clone()),
                _ => None,
            };
            accepted.ok_or_else(|| LinkError::Connect {
                endpoint: endpoint.clone(),
                reason: "connection refused".to_string(),
            })?
        };

        let (connected, peer) = new_pair(reply);
        self.peers
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .push(peer);
        Ok(connected)
    }
}
