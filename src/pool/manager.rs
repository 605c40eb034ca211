//! Session pool manager.

use super::config::PoolConfig;
use super::resolver::{DnsResolver, EndpointResolver};
use super::scheduler::{backoff_delay, DelayQueue, Job, ReconnectTask};
use super::types::{PendingStatus, PoolSnapshot, SessionStatus};
use crate::error::Result;
use crate::session::{Session, SessionListener, SessionRole};
use crate::transport::Transport;
use crate::types::{Endpoint, SessionId};
use crate::wire::Frame;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything guarded by the pool lock.
struct PoolState {
    sessions: BTreeMap<Endpoint, Arc<Session>>,
    pending: BTreeMap<Endpoint, Arc<ReconnectTask>>,
    rotation: usize,
    /// Installed sessions whose close has not been reported yet.
    opened: BTreeSet<SessionId>,
}

enum Install {
    Installed,
    /// The task was stopped or replaced, or the pool stopped.
    Abandoned,
    /// The session closed before it could be installed.
    Lost,
}

struct PoolInner {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn EndpointResolver>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    state: Mutex<PoolState>,
    running: AtomicBool,
    delays: DelayQueue,
    jobs: Sender<Job>,
    /// Dropping the sender stops the reconciler thread.
    reconciler: Mutex<Option<Sender<()>>>,
    /// Endpoints seen by the last successful resolution.
    resolved: Mutex<BTreeSet<Endpoint>>,
    this: Weak<PoolInner>,
}

/// Keeps at most one live session per endpoint and reconnects lost ones.
///
/// All reads and writes of the session map, the pending-reconnect map and the
/// rotation counter happen under one lock, so an endpoint never appears in
/// both maps and callers never observe a half-updated set.
///
/// # Example
///
/// ```ignore
/// let pool = SessionPool::new(config, Arc::new(TcpTransport::new()), Arc::new(DnsResolver))?;
/// pool.start()?;
///
/// if let Some(session) = pool.get_session() {
///     session.send(frame)?;
/// }
/// ```
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn EndpointResolver>,
    ) -> Result<Self> {
        let (jobs_tx, jobs_rx) = unbounded();
        let delays = DelayQueue::spawn(jobs_tx.clone())?;
        let workers = config.connect_workers.max(1);

        let inner = Arc::new_cyclic(|this| PoolInner {
            config,
            transport,
            resolver,
            listeners: RwLock::new(Vec::new()),
            state: Mutex::new(PoolState {
                sessions: BTreeMap::new(),
                pending: BTreeMap::new(),
                rotation: 0,
                opened: BTreeSet::new(),
            }),
            running: AtomicBool::new(false),
            delays,
            jobs: jobs_tx,
            reconciler: Mutex::new(None),
            resolved: Mutex::new(BTreeSet::new()),
            this: this.clone(),
        });

        for i in 0..workers {
            let pool = Arc::downgrade(&inner);
            let jobs = jobs_rx.clone();
            thread::Builder::new()
                .name(format!("heaplink-connect-{}", i))
                .spawn(move || worker_loop(pool, jobs))?;
        }

        Ok(Self { inner })
    }

    /// A pool resolving `config.hosts` through DNS.
    pub fn with_transport(config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(config, transport, Arc::new(DnsResolver))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Register a listener for session lifecycle and inbound frames.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Mark the pool running and begin periodic reconciliation against the
    /// resolved endpoints. The first reconciliation runs immediately.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stop the pool and close every session. No reconnects are scheduled
    /// afterwards.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running()
    }

    /// Next available session in rotation, or `None` without blocking.
    pub fn get_session(&self) -> Option<Arc<Session>> {
        self.inner.get_session()
    }

    /// Schedule a reconnect for `endpoint` unless one is pending or a session
    /// is live. Returns whether a task was scheduled.
    pub fn open_session(&self, endpoint: &Endpoint) -> bool {
        self.inner.open_session(endpoint)
    }

    /// Stop a pending reconnect, or close the live session and optionally
    /// reconnect it. Returns false if the endpoint had neither.
    pub fn close_session(&self, endpoint: &Endpoint, reconnect: bool) -> bool {
        self.inner.close_session(endpoint, reconnect)
    }

    /// Connect and handshake synchronously. Failures are logged and yield
    /// `None`. The session is not installed in the pool.
    pub fn connect(&self, endpoint: &Endpoint) -> Option<Arc<Session>> {
        self.inner.connect(endpoint)
    }

    /// The live session for `endpoint`, if any.
    pub fn session(&self, endpoint: &Endpoint) -> Option<Arc<Session>> {
        self.inner.state.lock().sessions.get(endpoint).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.state.lock().sessions.values().cloned().collect()
    }

    pub fn is_pending(&self, endpoint: &Endpoint) -> bool {
        self.inner.state.lock().pending.contains_key(endpoint)
    }

    /// Run one reconciliation pass now.
    pub fn reconcile(&self) {
        self.inner.reconcile();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state.lock();
        PoolSnapshot {
            running: self.inner.running(),
            sessions: state
                .sessions
                .iter()
                .map(|(endpoint, session)| SessionStatus {
                    endpoint: endpoint.clone(),
                    session: session.id(),
                    state: session.state(),
                    opened_at: session.opened_at(),
                })
                .collect(),
            pending: state
                .pending
                .iter()
                .map(|(endpoint, task)| PendingStatus {
                    endpoint: endpoint.clone(),
                    attempt: task.attempt(),
                })
                .collect(),
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.inner.stop();
        self.inner.delays.shutdown();
        for _ in 0..self.inner.config.connect_workers.max(1) {
            let _ = self.inner.jobs.send(Job::Shutdown);
        }
    }
}

fn worker_loop(pool: Weak<PoolInner>, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        let task = match job {
            Job::Attempt(task) => task,
            Job::Shutdown => break,
        };
        match pool.upgrade() {
            Some(pool) => pool.run_attempt(task),
            None => break,
        }
    }
}

impl PoolInner {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Arc<dyn SessionListener> {
        Arc::new(PoolHandler {
            pool: self.this.clone(),
        })
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(hosts = %self.config.hosts, "Session pool started");

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *self.reconciler.lock() = Some(stop_tx);
        let pool = self.this.clone();
        let interval = self.config.reconcile_interval;
        thread::Builder::new()
            .name("heaplink-reconciler".to_string())
            .spawn(move || reconcile_loop(pool, interval, stop_rx))?;
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.reconciler.lock().take();

        let (sessions, pending) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.sessions),
                std::mem::take(&mut state.pending),
            )
        };
        for task in pending.values() {
            task.stop();
        }
        for session in sessions.values() {
            session.close();
        }
        info!(
            closed = sessions.len(),
            abandoned = pending.len(),
            "Session pool stopped"
        );
    }

    fn get_session(&self) -> Option<Arc<Session>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let available: Vec<&Arc<Session>> = state
            .sessions
            .values()
            .filter(|s| s.is_available())
            .collect();
        if available.is_empty() {
            return None;
        }
        let chosen = Arc::clone(available[state.rotation % available.len()]);
        state.rotation = state.rotation.wrapping_add(1);
        Some(chosen)
    }

    fn open_session(&self, endpoint: &Endpoint) -> bool {
        if !self.running() {
            debug!(endpoint = %endpoint, "Pool not running, not opening session");
            return false;
        }
        let mut state = self.state.lock();
        if state.pending.contains_key(endpoint) || state.sessions.contains_key(endpoint) {
            return false;
        }
        self.schedule(&mut state, endpoint);
        true
    }

    /// Create and queue a fresh task. Caller holds the pool lock.
    fn schedule(&self, state: &mut PoolState, endpoint: &Endpoint) {
        let task = Arc::new(ReconnectTask::new(endpoint.clone()));
        state.pending.insert(endpoint.clone(), Arc::clone(&task));
        debug!(endpoint = %endpoint, "Reconnect scheduled");
        self.delays.after(Duration::ZERO, task);
    }

    fn close_session(&self, endpoint: &Endpoint, reconnect: bool) -> bool {
        let session = {
            let mut state = self.state.lock();
            if let Some(task) = state.pending.remove(endpoint) {
                task.stop();
                debug!(endpoint = %endpoint, "Pending reconnect stopped");
                return true;
            }
            let Some(session) = state.sessions.remove(endpoint) else {
                return false;
            };
            if reconnect && self.running() {
                self.schedule(&mut state, endpoint);
            }
            session
        };
        info!(endpoint = %endpoint, session = %session.id(), reconnect, "Closing session");
        session.close();
        true
    }

    fn connect(&self, endpoint: &Endpoint) -> Option<Arc<Session>> {
        let connected = match self.transport.connect(endpoint, self.config.connect_timeout) {
            Ok(connected) => connected,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Connect failed");
                return None;
            }
        };

        let session = Session::new(endpoint.clone(), SessionRole::Client, connected.link);
        if let Err(e) = session.start(connected.inbound, self.handler()) {
            warn!(endpoint = %endpoint, error = %e, "Could not start session");
            session.close();
            return None;
        }

        let hello = Frame::Hello {
            version: self.config.protocol_version,
            identity: self.config.identity.clone(),
        };
        if let Err(e) = session.send(hello) {
            debug!(endpoint = %endpoint, error = %e, "Hello not sent");
            session.close();
            return None;
        }

        let waited =
            session
                .handshake()
                .wait(endpoint, session.id(), self.config.handshake_timeout);
        match waited {
            Ok((version, remote_id)) if version == self.config.protocol_version => {
                session.mark_active(remote_id);
                Some(session)
            }
            Ok((version, _)) => {
                warn!(
                    endpoint = %endpoint,
                    offered = self.config.protocol_version,
                    accepted = version,
                    "Handshake version mismatch"
                );
                session.close();
                None
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Handshake failed");
                session.close();
                None
            }
        }
    }

    fn is_current(state: &PoolState, task: &Arc<ReconnectTask>) -> bool {
        state
            .pending
            .get(task.endpoint())
            .map_or(false, |current| Arc::ptr_eq(current, task))
    }

    /// Whether `task` may keep going. Drops it from the pending map if not.
    fn still_wanted(&self, state: &mut PoolState, task: &Arc<ReconnectTask>) -> bool {
        if !Self::is_current(state, task) {
            return false;
        }
        if task.is_stopped() || !self.running() {
            state.pending.remove(task.endpoint());
            return false;
        }
        true
    }

    fn run_attempt(&self, task: Arc<ReconnectTask>) {
        if !self.still_wanted(&mut self.state.lock(), &task) {
            debug!(endpoint = %task.endpoint(), "Reconnect abandoned");
            return;
        }

        let endpoint = task.endpoint().clone();
        let Some(session) = self.connect(&endpoint) else {
            self.retry(task);
            return;
        };

        match self.install(&task, &session) {
            Install::Installed => {
                info!(
                    endpoint = %endpoint,
                    session = %session.id(),
                    attempts = task.attempt() + 1,
                    "Session installed"
                );
                let listeners = self.listeners.read().clone();
                for listener in listeners {
                    listener.on_session_opened(&session);
                }
            }
            Install::Abandoned => {
                debug!(endpoint = %endpoint, "Reconnect abandoned after connect");
                session.close();
            }
            Install::Lost => {
                debug!(endpoint = %endpoint, "Session lost before install");
                self.retry(task);
            }
        }
    }

    /// Move `task`'s endpoint from the pending map to the session map.
    fn install(&self, task: &Arc<ReconnectTask>, session: &Arc<Session>) -> Install {
        let mut state = self.state.lock();
        if !self.still_wanted(&mut state, task) {
            return Install::Abandoned;
        }
        if session.is_closed() {
            return Install::Lost;
        }
        state.pending.remove(task.endpoint());
        state
            .sessions
            .insert(task.endpoint().clone(), Arc::clone(session));
        state.opened.insert(session.id());
        Install::Installed
    }

    fn retry(&self, task: Arc<ReconnectTask>) {
        let mut state = self.state.lock();
        if !self.still_wanted(&mut state, &task) {
            debug!(endpoint = %task.endpoint(), "Reconnect abandoned");
            return;
        }
        let attempt = task.record_failure();
        let delay = backoff_delay(self.config.reconnect_base, attempt);
        debug!(
            endpoint = %task.endpoint(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect backing off"
        );
        self.delays.after(delay, task);
    }

    /// A session's dispatcher finished. Reconnect if it was still installed.
    /// Drop a closed session and reconnect if it was still live. Returns
    /// whether the session was ever installed.
    fn on_session_closed(&self, session: &Arc<Session>) -> bool {
        let endpoint = session.endpoint();
        let reconnect = {
            let mut state = self.state.lock();
            let announced = state.opened.remove(&session.id());
            let installed = state
                .sessions
                .get(endpoint)
                .map_or(false, |current| Arc::ptr_eq(current, session));
            if !installed {
                return announced;
            }
            state.sessions.remove(endpoint);
            let running = self.running();
            if running {
                self.schedule(&mut state, endpoint);
            }
            running
        };
        warn!(endpoint = %endpoint, session = %session.id(), reconnect, "Session lost");
        true
    }

    fn reconcile(&self) {
        let resolved = match self.resolver.resolve(&self.config.hosts) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(hosts = %self.config.hosts, error = %e, "Endpoint resolution failed, keeping topology");
                return;
            }
        };

        let vanished: Vec<Endpoint> = {
            let mut previous = self.resolved.lock();
            let vanished = previous.difference(&resolved).cloned().collect();
            *previous = resolved.clone();
            vanished
        };

        for endpoint in &resolved {
            self.open_session(endpoint);
        }
        for endpoint in &vanished {
            info!(endpoint = %endpoint, "Endpoint no longer resolved");
            self.close_session(endpoint, false);
        }
    }
}

fn reconcile_loop(pool: Weak<PoolInner>, interval: Duration, stop: Receiver<()>) {
    let ticker = tick(interval);
    match pool.upgrade() {
        Some(pool) => pool.reconcile(),
        None => return,
    }
    loop {
        select! {
            recv(ticker) -> _ => match pool.upgrade() {
                Some(pool) => pool.reconcile(),
                None => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!("Reconciler stopped");
}

/// Listener installed on every pool session; forwards to user listeners.
struct PoolHandler {
    pool: Weak<PoolInner>,
}

impl SessionListener for PoolHandler {
    fn on_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        let listeners = pool.listeners.read().clone();
        for listener in &listeners {
            listener.on_frame(session, frame.clone())?;
        }
        Ok(())
    }

    fn on_session_closed(&self, session: &Arc<Session>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if !pool.on_session_closed(session) {
            // Never installed, so listeners never saw it open.
            return;
        }
        let listeners = pool.listeners.read().clone();
        for listener in &listeners {
            listener.on_session_closed(session);
        }
    }
}
