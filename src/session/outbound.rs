//! Per-session outbound frame queue with delta backlog conflation.

use crate::conflate::Conflater;
use crate::error::Result;
use crate::heap::DeltaBlock;
use crate::types::SubscriptionId;
use crate::wire::Frame;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

struct QueueInner {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// FIFO of frames waiting for the session's writer thread.
///
/// Deltas for one subscription that are still queued form its backlog. When
/// a new delta would push the backlog past the configured depth, the whole
/// backlog plus the new block is conflated into a single delta, which takes
/// the place of the oldest pending one. Nothing is dropped.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    conflations: AtomicU64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            conflations: AtomicU64::new(0),
        }
    }

    /// Append a frame. Returns false once the queue is closed.
    pub fn push(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.frames.push_back(frame);
        self.ready.notify_one();
        true
    }

    /// Queue a delta for `subscription_id`, conflating its backlog when it
    /// would exceed `max_depth` and a conflater is given.
    ///
    /// Returns `Ok(false)` once the queue is closed.
    pub fn push_delta(
        &self,
        subscription_id: SubscriptionId,
        heap_uri: &str,
        block: DeltaBlock,
        max_depth: usize,
        conflater: Option<&dyn Conflater>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(false);
        }

        let backlog: Vec<usize> = inner
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Frame::Delta {
                    subscription_id: id,
                    ..
                } if *id == subscription_id => Some(i),
                _ => None,
            })
            .collect();

        let conflater = match conflater {
            Some(c) if backlog.len() + 1 > max_depth.max(1) => c,
            _ => {
                inner.frames.push_back(Frame::Delta {
                    subscription_id,
                    heap_uri: heap_uri.to_string(),
                    block,
                });
                self.ready.notify_one();
                return Ok(true);
            }
        };

        let mut blocks = Vec::with_capacity(backlog.len() + 1);
        for &i in &backlog {
            if let Some(Frame::Delta { block, .. }) = inner.frames.get(i) {
                blocks.push(block.clone());
            }
        }
        blocks.push(block);
        let merged = conflater.conflate(&blocks)?;

        // Remove from the back so earlier indices stay valid.
        let first = backlog.first().copied();
        for &i in backlog.iter().rev() {
            inner.frames.remove(i);
        }
        let merged = Frame::Delta {
            subscription_id,
            heap_uri: heap_uri.to_string(),
            block: merged,
        };
        match first {
            Some(at) => inner.frames.insert(at, merged),
            None => inner.frames.push_back(merged),
        }
        self.conflations.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Ok(true)
    }

    /// Block until a frame is available. Returns `None` once closed.
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            self.ready.wait(&mut inner);
        }
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.inner.lock().frames.pop_front()
    }

    /// Take every queued frame.
    pub fn drain(&self) -> Vec<Frame> {
        self.inner.lock().frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued deltas for one subscription.
    pub fn pending_deltas(&self, subscription_id: SubscriptionId) -> usize {
        self.inner
            .lock()
            .frames
            .iter()
            .filter(|f| {
                matches!(f, Frame::Delta { subscription_id: id, .. } if *id == subscription_id)
            })
            .count()
    }

    /// How many times a backlog has been conflated.
    pub fn conflation_count(&self) -> u64 {
        self.conflations.load(Ordering::Relaxed)
    }

    /// Close the queue, discarding anything still queued and waking the writer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.frames.clear();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
