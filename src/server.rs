//! TCP server publishing heaps from a [`HeapRegistry`].
//!
//! The server accepts connections, runs the server half of the handshake
//! (protocol version and required identity keys, within a timeout), routes
//! `Subscribe`/`Unsubscribe` frames to the registry, and tears subscriptions
//! down when sessions close.

use crate::error::{LinkError, Result};
use crate::heap::HeapRegistry;
use crate::session::{HandshakeOutcome, Session, SessionListener, SessionRole, SessionState};
use crate::transport::tcp::spawn_link;
use crate::types::{Endpoint, SessionId, SubscriptionId};
use crate::wire::{CloseReason, Frame, PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a [`HeapServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on.
    /// Default: `127.0.0.1:0`
    pub bind: String,

    /// The only protocol version accepted.
    pub protocol_version: u32,

    /// Identity keys every `Hello` must carry.
    /// Default: none
    pub required_identity: Vec<String>,

    /// How long a new connection may take to send a valid `Hello`.
    /// Default: 5s
    pub handshake_timeout: Duration,

    /// Sleep between polls of the non-blocking listener.
    /// Default: 10ms
    pub accept_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            required_identity: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
            accept_poll: Duration::from_millis(10),
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    registry: Arc<HeapRegistry>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    shutdown: AtomicBool,
    this: Weak<ServerInner>,
}

/// Accepts subscriber connections and serves heaps to them.
pub struct HeapServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl HeapServer {
    /// Bind the listener and start accepting.
    pub fn bind(config: ServerConfig, registry: Arc<HeapRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new_cyclic(|this| ServerInner {
            config,
            registry,
            sessions: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            this: this.clone(),
        });

        let acceptor = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("heaplink-accept-{}", local_addr.port()))
                .spawn(move || inner.accept_loop(listener))?
        };
        info!(addr = %local_addr, "Heap server listening");

        Ok(Self {
            inner,
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address as an endpoint a pool can connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.to_string())
    }

    pub fn registry(&self) -> &Arc<HeapRegistry> {
        &self.inner.registry
    }

    /// Connected sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.inner.sessions.lock();
        let ordered: BTreeMap<SessionId, Arc<Session>> = sessions
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        ordered.into_values().collect()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(&id).cloned()
    }

    /// Tell a session to stop issuing new work. Its subscriptions end with
    /// `SUSPEND_RECEIVED`.
    pub fn suspend(&self, id: SessionId) -> Result<usize> {
        self.control(id, Frame::Suspend, CloseReason::SuspendReceived)
    }

    /// Warn a session that it will be closed soon. Its subscriptions end with
    /// `DISCONNECT_RECEIVED`.
    pub fn disconnect(&self, id: SessionId) -> Result<usize> {
        self.control(id, Frame::Disconnect, CloseReason::DisconnectReceived)
    }

    fn control(&self, id: SessionId, frame: Frame, reason: CloseReason) -> Result<usize> {
        let session = self.session(id).ok_or(LinkError::SessionClosed(id))?;
        session.send(frame.clone())?;
        session.apply_control(&frame);
        let ended = self.inner.registry.terminate_session(id, reason);
        info!(session = %id, control = frame.kind(), terminated = ended, "Control frame sent");
        Ok(ended)
    }

    /// End one subscription as the publisher's administrator.
    pub fn terminate(&self, subscription_id: SubscriptionId) -> bool {
        self.inner
            .registry
            .terminate(subscription_id, CloseReason::RequestedByPublisherAdministrator)
    }

    /// Close one session. Returns false if it was unknown or already closing.
    pub fn close_session(&self, id: SessionId) -> bool {
        match self.session(id) {
            Some(session) => session.close(),
            None => false,
        }
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        for session in &sessions {
            session.close();
        }
        info!(addr = %self.local_addr, closed = sessions.len(), "Heap server stopped");
    }
}

impl Drop for HeapServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerInner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to admit connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(self.config.accept_poll);
                }
            }
        }
        debug!("Accept loop stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let connected = spawn_link(stream)?;
        let session = Session::new(
            Endpoint::new(peer.to_string()),
            SessionRole::Server,
            connected.link,
        );
        self.sessions.lock().insert(session.id(), Arc::clone(&session));

        let handler = Arc::new(ServerHandler {
            server: self.this.clone(),
        });
        if let Err(e) = session.start(connected.inbound, handler) {
            self.sessions.lock().remove(&session.id());
            return Err(e);
        }

        let watched = Arc::clone(&session);
        let timeout = self.config.handshake_timeout;
        thread::Builder::new()
            .name(format!("heaplink-handshake-{}", session.id()))
            .spawn(move || {
                let waited = watched
                    .handshake()
                    .wait(watched.endpoint(), watched.id(), timeout);
                if let Err(e) = waited {
                    debug!(session = %watched.id(), error = %e, "Handshake not completed");
                    watched.close();
                }
            })?;

        debug!(peer = %peer, session = %session.id(), "Connection accepted");
        Ok(())
    }

    fn handle_hello(
        &self,
        session: &Arc<Session>,
        version: u32,
        identity: &BTreeMap<String, String>,
    ) -> Result<()> {
        if !session.handshake().is_pending() {
            return Err(LinkError::ProtocolViolation("duplicate hello".to_string()));
        }

        let missing: Vec<&str> = self
            .config
            .required_identity
            .iter()
            .filter(|key| !identity.contains_key(*key))
            .map(String::as_str)
            .collect();
        let refusal = if version != self.config.protocol_version {
            Some(format!("unsupported protocol version {}", version))
        } else if !missing.is_empty() {
            Some(format!("missing identity keys: {}", missing.join(", ")))
        } else {
            None
        };

        if let Some(reason) = refusal {
            let _ = session.send_direct(&Frame::Rejected {
                reason: reason.clone(),
            });
            session
                .handshake()
                .complete(HandshakeOutcome::Rejected(reason.clone()));
            return Err(LinkError::HandshakeRejected(reason));
        }

        session.send(Frame::Welcome {
            version,
            session_id: session.id(),
        })?;
        session.mark_active(session.id());
        session.handshake().complete(HandshakeOutcome::Accepted {
            version,
            remote_id: session.id(),
        });
        info!(session = %session.id(), peer = %session.endpoint(), "Session accepted");
        Ok(())
    }
}

/// Server-side session listener.
struct ServerHandler {
    server: Weak<ServerInner>,
}

impl SessionListener for ServerHandler {
    fn on_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        let Some(server) = self.server.upgrade() else {
            return Ok(());
        };
        match frame {
            Frame::Hello { version, identity } => server.handle_hello(session, version, &identity),
            other if session.state() == SessionState::Handshaking => Err(
                LinkError::ProtocolViolation(format!("{} before hello", other.kind())),
            ),
            other => SessionListener::on_frame(server.registry.as_ref(), session, other),
        }
    }

    fn on_session_closed(&self, session: &Arc<Session>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        server.sessions.lock().remove(&session.id());
        server.registry.on_session_closed(session.id());
        debug!(session = %session.id(), "Session removed");
    }
}
