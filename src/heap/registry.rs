//! Heap subscription registry for the publishing side.

use super::delta::{apply_block, DeltaBlock};
use super::types::{HeapSnapshot, RegistryConfig, Subscription, TerminationNotice};
use crate::conflate::{Conflater, ConflaterRegistry};
use crate::error::{LinkError, Result};
use crate::session::{Session, SessionListener};
use crate::types::{Sequence, SessionId, SubscriptionId, Timestamp};
use crate::wire::{CloseReason, Frame};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Heap {
    state: Value,
    last_update_id: Sequence,
    subscriptions: BTreeSet<SubscriptionId>,
}

/// Internal subscription state.
struct ActiveSubscription {
    info: Subscription,
    session: Arc<Session>,
}

struct RegistryState {
    heaps: BTreeMap<String, Heap>,
    subscriptions: HashMap<SubscriptionId, ActiveSubscription>,
    by_session: HashMap<SessionId, BTreeSet<SubscriptionId>>,
    /// Sessions whose teardown has begun. Later subscribes are rejected.
    torn_down: LruCache<SessionId, ()>,
}

impl RegistryState {
    /// Unlink a subscription from every index.
    fn unlink(&mut self, id: SubscriptionId) -> Option<ActiveSubscription> {
        let active = self.subscriptions.remove(&id)?;
        if let Some(heap) = self.heaps.get_mut(&active.info.heap_uri) {
            heap.subscriptions.remove(&id);
        }
        if let Some(ids) = self.by_session.get_mut(&active.info.session) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_session.remove(&active.info.session);
            }
        }
        Some(active)
    }

    fn session_subscriptions(&self, session: SessionId) -> Vec<SubscriptionId> {
        self.by_session
            .get(&session)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Tracks heaps, their update sequence and the subscriptions that receive
/// their deltas.
///
/// Every mutation happens under one lock, so a subscription's `Subscribed`
/// snapshot is always queued before any delta that follows it, and session
/// teardown is linearized against new subscribes on that session.
pub struct HeapRegistry {
    config: RegistryConfig,
    conflater: Option<Arc<dyn Conflater>>,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    notices_tx: Sender<TerminationNotice>,
    notices_rx: Receiver<TerminationNotice>,
}

impl HeapRegistry {
    /// Create a registry using only the built-in conflaters.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_conflaters(config, &ConflaterRegistry::new())
    }

    /// Create a registry, resolving the configured strategy against `conflaters`.
    pub fn with_conflaters(config: RegistryConfig, conflaters: &ConflaterRegistry) -> Result<Self> {
        let conflater = if config.conflation.is_enabled() {
            Some(conflaters.resolve(&config.conflation)?)
        } else {
            None
        };
        let tombstones = NonZeroUsize::new(config.tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        let (notices_tx, notices_rx) = bounded(config.notice_buffer.max(1));

        Ok(Self {
            config,
            conflater,
            state: Mutex::new(RegistryState {
                heaps: BTreeMap::new(),
                subscriptions: HashMap::new(),
                by_session: HashMap::new(),
                torn_down: LruCache::new(tombstones),
            }),
            next_id: AtomicU64::new(1),
            notices_tx,
            notices_rx,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Termination notices, one per ended subscription.
    ///
    /// Receivers share one queue of `notice_buffer` entries. When nobody
    /// drains it the oldest notices give way to new ones, so a late observer
    /// still sees the most recent terminations.
    pub fn notices(&self) -> Receiver<TerminationNotice> {
        self.notices_rx.clone()
    }

    // --- Heaps ---

    pub fn create_heap(&self, uri: impl Into<String>, initial_state: Value) -> Result<()> {
        let uri = uri.into();
        let mut state = self.state.lock();
        if state.heaps.contains_key(&uri) {
            return Err(LinkError::HeapExists(uri));
        }
        debug!(heap = %uri, "Created heap");
        state.heaps.insert(
            uri,
            Heap {
                state: initial_state,
                last_update_id: Sequence(0),
                subscriptions: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a heap, terminating its subscriptions on the publisher's behalf.
    pub fn remove_heap(&self, uri: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let ids: Vec<SubscriptionId> = match state.heaps.get(uri) {
            Some(heap) => heap.subscriptions.iter().copied().collect(),
            None => return Err(LinkError::HeapNotFound(uri.to_string())),
        };
        for id in &ids {
            if let Some(active) = state.unlink(*id) {
                self.finish(active, CloseReason::RequestedByPublisherAdministrator);
            }
        }
        state.heaps.remove(uri);
        info!(heap = %uri, terminated = ids.len(), "Removed heap");
        Ok(ids.len())
    }

    /// Current sequence and state of a heap.
    pub fn heap_state(&self, uri: &str) -> Option<(Sequence, Value)> {
        self.state
            .lock()
            .heaps
            .get(uri)
            .map(|heap| (heap.last_update_id, heap.state.clone()))
    }

    pub fn last_update_id(&self, uri: &str) -> Option<Sequence> {
        self.state.lock().heaps.get(uri).map(|heap| heap.last_update_id)
    }

    // --- Subscriptions ---

    /// Subscribe `session` to a heap without a client request to answer.
    pub fn subscribe(&self, session: &Arc<Session>, heap_uri: &str) -> Result<Subscription> {
        self.subscribe_request(session, 0, heap_uri)
    }

    /// Subscribe `session` to a heap, answering `request_id` with a
    /// `Subscribed` frame that carries the current snapshot.
    pub fn subscribe_request(
        &self,
        session: &Arc<Session>,
        request_id: u64,
        heap_uri: &str,
    ) -> Result<Subscription> {
        let session_id = session.id();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.torn_down.contains(&session_id) || session.is_closed() {
            return Err(LinkError::SessionTornDown(session_id));
        }
        if !session.is_available() {
            return Err(LinkError::SessionUnavailable(session_id));
        }

        let heap = state
            .heaps
            .get(heap_uri)
            .ok_or_else(|| LinkError::HeapNotFound(heap_uri.to_string()))?;

        if !self.config.allow_duplicate_subscriptions {
            let duplicate = state
                .by_session
                .get(&session_id)
                .map_or(false, |ids| ids.iter().any(|id| heap.subscriptions.contains(id)));
            if duplicate {
                return Err(LinkError::SubscriptionActive {
                    session: session_id,
                    heap: heap_uri.to_string(),
                });
            }
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        session
            .send(Frame::Subscribed {
                request_id,
                subscription_id: id,
                heap_uri: heap_uri.to_string(),
                sequence: heap.last_update_id,
                snapshot: heap.state.clone(),
            })
            .map_err(|_| LinkError::SessionTornDown(session_id))?;

        let info = Subscription {
            id,
            session: session_id,
            heap_uri: heap_uri.to_string(),
            created_at: Timestamp::now(),
        };
        if let Some(heap) = state.heaps.get_mut(heap_uri) {
            heap.subscriptions.insert(id);
        }
        state.by_session.entry(session_id).or_default().insert(id);
        state.subscriptions.insert(
            id,
            ActiveSubscription {
                info: info.clone(),
                session: Arc::clone(session),
            },
        );

        debug!(subscription = %id, session = %session_id, heap = %heap_uri, "Subscribed");
        Ok(info)
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.state
            .lock()
            .subscriptions
            .get(&id)
            .map(|active| active.info.clone())
    }

    /// Subscriptions owned by one session.
    pub fn subscriptions_for(&self, session: SessionId) -> Vec<Subscription> {
        let state = self.state.lock();
        state
            .session_subscriptions(session)
            .into_iter()
            .filter_map(|id| state.subscriptions.get(&id).map(|a| a.info.clone()))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    // --- Publication ---

    /// Apply `block` to a heap and queue it for every subscriber.
    ///
    /// The block must start at the heap's `last_update_id` and advance it.
    /// Returns the new `last_update_id`.
    pub fn publish_delta(&self, heap_uri: &str, block: DeltaBlock) -> Result<Sequence> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let heap = state
            .heaps
            .get_mut(heap_uri)
            .ok_or_else(|| LinkError::HeapNotFound(heap_uri.to_string()))?;
        if block.from != heap.last_update_id || block.to <= block.from {
            return Err(LinkError::InvalidSequence(block.from, heap.last_update_id));
        }

        apply_block(&mut heap.state, &block);
        heap.last_update_id = block.to;

        for id in &heap.subscriptions {
            let Some(active) = state.subscriptions.get(id) else {
                continue;
            };
            let queued = active.session.send_delta(
                *id,
                heap_uri,
                block.clone(),
                self.config.max_backlog_depth,
                self.conflater.as_deref(),
            );
            match queued {
                Ok(()) | Err(LinkError::SessionClosed(_)) => {}
                Err(e) => {
                    warn!(
                        subscription = %id,
                        heap = %heap_uri,
                        error = %e,
                        "Conflation failed, queueing delta unmerged"
                    );
                    let _ = active.session.send_delta(*id, heap_uri, block.clone(), 0, None);
                }
            }
        }

        Ok(heap.last_update_id)
    }

    // --- Termination ---

    /// End one subscription. Only acts when `session` and `heap_uri` match the
    /// subscription; returns false if it was already gone.
    pub fn terminate_subscription(
        &self,
        session: SessionId,
        heap_uri: &str,
        subscription_id: SubscriptionId,
        reason: CloseReason,
    ) -> bool {
        let mut state = self.state.lock();
        let matches = state
            .subscriptions
            .get(&subscription_id)
            .map_or(false, |a| a.info.session == session && a.info.heap_uri == heap_uri);
        if !matches {
            return false;
        }
        match state.unlink(subscription_id) {
            Some(active) => {
                self.finish(active, reason);
                true
            }
            None => false,
        }
    }

    /// End a subscription by id alone.
    pub fn terminate(&self, subscription_id: SubscriptionId, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        match state.unlink(subscription_id) {
            Some(active) => {
                self.finish(active, reason);
                true
            }
            None => false,
        }
    }

    /// End every subscription owned by `session` with `reason`.
    pub fn terminate_session(&self, session: SessionId, reason: CloseReason) -> usize {
        let mut state = self.state.lock();
        self.terminate_all(&mut state, session, reason)
    }

    /// Tear down everything owned by a closed session with `CONNECTION_LOST`.
    ///
    /// From this point on, subscribes on that session are rejected.
    pub fn on_session_closed(&self, session: SessionId) -> usize {
        let mut state = self.state.lock();
        state.torn_down.put(session, ());
        let count = self.terminate_all(&mut state, session, CloseReason::ConnectionLost);
        if count > 0 {
            debug!(session = %session, terminated = count, "Session subscriptions torn down");
        }
        count
    }

    fn terminate_all(
        &self,
        state: &mut RegistryState,
        session: SessionId,
        reason: CloseReason,
    ) -> usize {
        let mut count = 0;
        for id in state.session_subscriptions(session) {
            if let Some(active) = state.unlink(id) {
                self.finish(active, reason);
                count += 1;
            }
        }
        count
    }

    /// Tell the subscriber (unless its session is gone) and publish a notice.
    fn finish(&self, active: ActiveSubscription, reason: CloseReason) {
        let ActiveSubscription { info, session } = active;
        if reason != CloseReason::ConnectionLost {
            let _ = session.send(Frame::Terminated {
                subscription_id: info.id,
                reason,
            });
        }
        debug!(subscription = %info.id, session = %info.session, heap = %info.heap_uri, reason = %reason, "Subscription terminated");

        let notice = TerminationNotice {
            subscription_id: info.id,
            session: info.session,
            heap_uri: info.heap_uri,
            reason,
            at: Timestamp::now(),
        };
        self.publish_notice(notice);
    }

    /// Queue a notice, evicting the oldest one when the buffer is full.
    fn publish_notice(&self, mut notice: TerminationNotice) {
        loop {
            match self.notices_tx.try_send(notice) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(stale) = self.notices_rx.try_recv() {
                        warn!(subscription = %stale.subscription_id, "Notice buffer full, evicted oldest termination notice");
                    }
                    notice = rejected;
                }
            }
        }
    }

    // --- Monitoring ---

    pub fn snapshot(&self, heap_uri: &str) -> Option<HeapSnapshot> {
        let state = self.state.lock();
        state
            .heaps
            .get(heap_uri)
            .map(|heap| Self::heap_snapshot(&state, heap_uri, heap))
    }

    /// Monitoring view of every heap, ordered by uri.
    pub fn monitor(&self) -> Vec<HeapSnapshot> {
        let state = self.state.lock();
        state
            .heaps
            .iter()
            .map(|(uri, heap)| Self::heap_snapshot(&state, uri, heap))
            .collect()
    }

    fn heap_snapshot(state: &RegistryState, uri: &str, heap: &Heap) -> HeapSnapshot {
        let mut by_session: BTreeMap<SessionId, Vec<SubscriptionId>> = BTreeMap::new();
        for id in &heap.subscriptions {
            if let Some(active) = state.subscriptions.get(id) {
                by_session.entry(active.info.session).or_default().push(*id);
            }
        }
        HeapSnapshot {
            uri: uri.to_string(),
            last_update_id: heap.last_update_id,
            subscription_count: heap.subscriptions.len(),
            subscriptions_by_session: by_session,
        }
    }
}

impl SessionListener for HeapRegistry {
    fn on_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Subscribe {
                request_id,
                heap_uri,
            } => match self.subscribe_request(session, request_id, &heap_uri) {
                Ok(_) | Err(LinkError::SessionTornDown(_)) => Ok(()),
                Err(e) => {
                    debug!(session = %session.id(), heap = %heap_uri, error = %e, "Subscribe refused");
                    let _ = session.send(Frame::SubscribeFailed {
                        request_id,
                        reason: e.to_string(),
                    });
                    Ok(())
                }
            },
            Frame::Unsubscribe { subscription_id } => {
                let owner = self.subscription(subscription_id).map(|s| s.session);
                match owner {
                    Some(owner) if owner != session.id() => Err(LinkError::ProtocolViolation(
                        format!("unsubscribe of foreign subscription {}", subscription_id),
                    )),
                    Some(_) => {
                        self.terminate(subscription_id, CloseReason::RequestedBySubscriber);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            other => Err(LinkError::ProtocolViolation(format!(
                "unexpected {} frame",
                other.kind()
            ))),
        }
    }

    fn on_session_closed(&self, session: &Arc<Session>) {
        self.on_session_closed(session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflate::ConflationStrategy;
    use crate::heap::DeltaOp;
    use crate::session::SessionRole;
    use crate::transport::memory::loopback;
    use crate::types::Endpoint;
    use serde_json::json;

    fn active_session() -> Arc<Session> {
        let (connected, _peer) = loopback();
        let session = Session::new(Endpoint::new("client:1"), SessionRole::Server, connected.link);
        session.mark_active(session.id());
        session
    }

    fn registry(config: RegistryConfig) -> HeapRegistry {
        let registry = HeapRegistry::new(config).unwrap();
        registry.create_heap("heap://a", json!({"x": 0})).unwrap();
        registry.create_heap("heap://b", json!({})).unwrap();
        registry
    }

    fn set_x(from: u64, value: i64) -> DeltaBlock {
        DeltaBlock::next(Sequence(from), vec![DeltaOp::set(["x"], json!(value))])
    }

    #[test]
    fn test_subscribe_queues_snapshot_first() {
        let registry = registry(RegistryConfig::default());
        let session = active_session();

        registry.publish_delta("heap://a", set_x(0, 1)).unwrap();
        let sub = registry.subscribe_request(&session, 42, "heap://a").unwrap();
        registry.publish_delta("heap://a", set_x(1, 2)).unwrap();

        let frames = session.outbound().drain();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Subscribed {
                request_id,
                subscription_id,
                sequence,
                snapshot,
                ..
            } => {
                assert_eq!(*request_id, 42);
                assert_eq!(*subscription_id, sub.id);
                assert_eq!(*sequence, Sequence(1));
                assert_eq!(snapshot, &json!({"x": 1}));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(&frames[1], Frame::Delta { block, .. } if block.from == Sequence(1)));
    }

    #[test]
    fn test_duplicate_subscription_policy() {
        let session = active_session();

        let strict = registry(RegistryConfig::default());
        strict.subscribe(&session, "heap://a").unwrap();
        assert!(matches!(
            strict.subscribe(&session, "heap://a"),
            Err(LinkError::SubscriptionActive { .. })
        ));
        assert!(strict.subscribe(&session, "heap://b").is_ok());

        let relaxed = registry(RegistryConfig {
            allow_duplicate_subscriptions: true,
            ..Default::default()
        });
        relaxed.subscribe(&session, "heap://a").unwrap();
        relaxed.subscribe(&session, "heap://a").unwrap();
        assert_eq!(relaxed.subscription_count(), 2);
    }

    #[test]
    fn test_unknown_heap_and_bad_sequence() {
        let registry = registry(RegistryConfig::default());
        let session = active_session();

        assert!(matches!(
            registry.subscribe(&session, "heap://missing"),
            Err(LinkError::HeapNotFound(_))
        ));
        assert!(matches!(
            registry.publish_delta("heap://a", set_x(3, 1)),
            Err(LinkError::InvalidSequence(Sequence(3), Sequence(0)))
        ));
        assert!(matches!(
            registry.publish_delta("heap://a", DeltaBlock::new(Sequence(0), Sequence(0), vec![])),
            Err(LinkError::InvalidSequence(..))
        ));
        assert!(matches!(
            registry.create_heap("heap://a", json!(null)),
            Err(LinkError::HeapExists(_))
        ));
    }

    #[test]
    fn test_last_update_id_only_increases() {
        let registry = registry(RegistryConfig::default());
        let mut last = Sequence(0);
        for i in 0..20 {
            let next = registry.publish_delta("heap://a", set_x(i, i as i64)).unwrap();
            assert!(next > last);
            last = next;
        }
        let _ = registry.publish_delta("heap://a", set_x(5, 0));
        assert_eq!(registry.last_update_id("heap://a"), Some(Sequence(20)));
    }

    #[test]
    fn test_double_terminate_emits_one_notice() {
        let registry = registry(RegistryConfig::default());
        let notices = registry.notices();
        let session = active_session();
        let sub = registry.subscribe(&session, "heap://a").unwrap();

        assert!(registry.terminate_subscription(
            session.id(),
            "heap://a",
            sub.id,
            CloseReason::RequestedBySubscriber
        ));
        assert!(!registry.terminate_subscription(
            session.id(),
            "heap://a",
            sub.id,
            CloseReason::RequestedBySubscriber
        ));

        let received: Vec<_> = notices.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].reason, CloseReason::RequestedBySubscriber);

        let terminated = session
            .outbound()
            .drain()
            .into_iter()
            .filter(|f| matches!(f, Frame::Terminated { .. }))
            .count();
        assert_eq!(terminated, 1);
    }

    #[test]
    fn test_full_notice_buffer_keeps_newest() {
        let registry = registry(RegistryConfig {
            notice_buffer: 4,
            ..Default::default()
        });
        let mut sessions = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..6 {
            let session = active_session();
            ids.push(registry.subscribe(&session, "heap://a").unwrap().id);
            sessions.push(session);
        }
        for session in &sessions {
            assert_eq!(registry.on_session_closed(session.id()), 1);
        }

        let received: Vec<_> = registry
            .notices()
            .try_iter()
            .map(|n| (n.subscription_id, n.reason))
            .collect();
        let expected: Vec<_> = ids[2..]
            .iter()
            .map(|id| (*id, CloseReason::ConnectionLost))
            .collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_terminate_requires_matching_owner() {
        let registry = registry(RegistryConfig::default());
        let session = active_session();
        let other = active_session();
        let sub = registry.subscribe(&session, "heap://a").unwrap();

        assert!(!registry.terminate_subscription(
            other.id(),
            "heap://a",
            sub.id,
            CloseReason::RequestedBySubscriber
        ));
        assert!(!registry.terminate_subscription(
            session.id(),
            "heap://b",
            sub.id,
            CloseReason::RequestedBySubscriber
        ));
        assert!(registry.subscription(sub.id).is_some());
    }

    #[test]
    fn test_session_teardown_blocks_new_subscribes() {
        let registry = registry(RegistryConfig::default());
        let session = active_session();
        registry.subscribe(&session, "heap://a").unwrap();

        assert_eq!(registry.on_session_closed(session.id()), 1);
        assert!(matches!(
            registry.subscribe(&session, "heap://b"),
            Err(LinkError::SessionTornDown(_))
        ));
        assert_eq!(registry.on_session_closed(session.id()), 0);
    }

    #[test]
    fn test_suspended_session_is_not_subscribable() {
        let registry = registry(RegistryConfig::default());
        let session = active_session();
        session.apply_control(&Frame::Suspend);

        assert!(matches!(
            registry.subscribe(&session, "heap://a"),
            Err(LinkError::SessionUnavailable(_))
        ));
    }

    #[test]
    fn test_remove_heap_terminates_as_administrator() {
        let registry = registry(RegistryConfig::default());
        let notices = registry.notices();
        let a = active_session();
        let b = active_session();
        registry.subscribe(&a, "heap://a").unwrap();
        registry.subscribe(&b, "heap://a").unwrap();

        assert_eq!(registry.remove_heap("heap://a").unwrap(), 2);
        let reasons: Vec<_> = notices.try_iter().map(|n| n.reason).collect();
        assert_eq!(
            reasons,
            vec![CloseReason::RequestedByPublisherAdministrator; 2]
        );
        assert!(registry.snapshot("heap://a").is_none());
        assert!(matches!(
            registry.remove_heap("heap://a"),
            Err(LinkError::HeapNotFound(_))
        ));
    }

    #[test]
    fn test_slow_consumer_backlog_is_bounded() {
        let registry = registry(RegistryConfig {
            max_backlog_depth: 4,
            conflation: ConflationStrategy::Smart,
            ..Default::default()
        });
        let session = active_session();
        let sub = registry.subscribe(&session, "heap://a").unwrap();

        for i in 0..50 {
            registry.publish_delta("heap://a", set_x(i, i as i64 + 1)).unwrap();
        }
        assert!(session.outbound().pending_deltas(sub.id) <= 4);

        let mut replica = json!(null);
        let mut at = Sequence(0);
        for frame in session.outbound().drain() {
            match frame {
                Frame::Subscribed { snapshot, .. } => replica = snapshot,
                Frame::Delta { block, .. } => {
                    assert_eq!(block.from, at);
                    at = block.to;
                    apply_block(&mut replica, &block);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(at, Sequence(50));
        assert_eq!(replica, json!({"x": 50}));
    }

    #[test]
    fn test_disabled_conflation_keeps_every_delta() {
        let registry = registry(RegistryConfig {
            max_backlog_depth: 2,
            conflation: ConflationStrategy::None,
            ..Default::default()
        });
        let session = active_session();
        let sub = registry.subscribe(&session, "heap://a").unwrap();
        for i in 0..10 {
            registry.publish_delta("heap://a", set_x(i, 1)).unwrap();
        }
        assert_eq!(session.outbound().pending_deltas(sub.id), 10);
    }

    #[test]
    fn test_snapshot_groups_by_session() {
        let registry = registry(RegistryConfig::default());
        let a = active_session();
        let b = active_session();
        let sa = registry.subscribe(&a, "heap://a").unwrap();
        let sb = registry.subscribe(&b, "heap://a").unwrap();
        registry.publish_delta("heap://a", set_x(0, 9)).unwrap();

        let snapshot = registry.snapshot("heap://a").unwrap();
        assert_eq!(snapshot.last_update_id, Sequence(1));
        assert_eq!(snapshot.subscription_count, 2);
        assert_eq!(snapshot.subscriptions_by_session[&a.id()], vec![sa.id]);
        assert_eq!(snapshot.subscriptions_by_session[&b.id()], vec![sb.id]);
        assert_eq!(registry.monitor().len(), 2);
    }

    #[test]
    fn test_unknown_custom_conflater_is_config_error() {
        let result = HeapRegistry::new(RegistryConfig {
            conflation: ConflationStrategy::Custom("nope".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(LinkError::UnknownConflater(_))));
    }
}
