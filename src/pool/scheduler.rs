//! Reconnect tasks, backoff and the delay queue that paces them.

use crate::error::Result;
use crate::types::Endpoint;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Delay before reconnect attempt number `attempt` (zero-based):
/// `base * (1 - 0.9^attempt) / 0.1`.
///
/// The first attempt is immediate; later ones approach `10 * base`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let factor = (1.0 - 0.9f64.powi(exponent)) / 0.1;
    base.mul_f64(factor.max(0.0))
}

/// Pending reconnection work for one endpoint without a live session.
#[derive(Debug)]
pub struct ReconnectTask {
    endpoint: Endpoint,
    attempt: AtomicU32,
    stopped: AtomicBool,
}

impl ReconnectTask {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            attempt: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Record a failed attempt, returning the new count.
    pub(crate) fn record_failure(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Work for the connect workers.
pub(crate) enum Job {
    Attempt(Arc<ReconnectTask>),
    Shutdown,
}

enum Command {
    Schedule(Instant, Arc<ReconnectTask>),
    Shutdown,
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Arc<ReconnectTask>,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds tasks until their backoff elapses, then hands them to the workers.
pub(crate) struct DelayQueue {
    commands: Sender<Command>,
}

impl DelayQueue {
    pub(crate) fn spawn(jobs: Sender<Job>) -> Result<Self> {
        let (commands, rx) = unbounded();
        thread::Builder::new()
            .name("heaplink-scheduler".to_string())
            .spawn(move || run(rx, jobs))?;
        Ok(Self { commands })
    }

    pub(crate) fn after(&self, delay: Duration, task: Arc<ReconnectTask>) {
        let _ = self
            .commands
            .send(Command::Schedule(Instant::now() + delay, task));
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn run(commands: Receiver<Command>, jobs: Sender<Job>) {
    let mut queue: BinaryHeap<Delayed> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while queue.peek().map_or(false, |head| head.due <= now) {
            if let Some(due) = queue.pop() {
                if jobs.send(Job::Attempt(due.task)).is_err() {
                    return;
                }
            }
        }

        let command = match queue.peek() {
            Some(head) => match commands.recv_timeout(head.due.saturating_duration_since(now)) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule(due, task) => {
                seq += 1;
                queue.push(Delayed { due, seq, task });
            }
            Command::Shutdown => break,
        }
    }
    debug!(dropped = queue.len(), "Reconnect scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_formula() {
        let base = Duration::from_millis(100);
        let close_to = |d: Duration, micros: u64| {
            (d.as_micros() as i64 - micros as i64).abs() <= 1
        };
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert!(close_to(backoff_delay(base, 1), 100_000));
        assert!(close_to(backoff_delay(base, 2), 190_000));
        assert!(close_to(backoff_delay(base, 3), 271_000));

        let late = backoff_delay(base, 200);
        assert!(late <= Duration::from_secs(1));
        assert!(late > Duration::from_millis(999));
        assert!(backoff_delay(base, u32::MAX) <= Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_monotone() {
        let base = Duration::from_millis(50);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = backoff_delay(base, attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_delay_queue_orders_by_deadline() {
        let (jobs_tx, jobs_rx) = unbounded();
        let queue = DelayQueue::spawn(jobs_tx).unwrap();
        let late = Arc::new(ReconnectTask::new(Endpoint::new("late:1")));
        let early = Arc::new(ReconnectTask::new(Endpoint::new("early:1")));

        queue.after(Duration::from_millis(80), Arc::clone(&late));
        queue.after(Duration::from_millis(10), Arc::clone(&early));

        let first = jobs_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = jobs_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match (first, second) {
            (Job::Attempt(a), Job::Attempt(b)) => {
                assert_eq!(a.endpoint(), early.endpoint());
                assert_eq!(b.endpoint(), late.endpoint());
            }
            _ => panic!("expected two attempts"),
        }
        queue.shutdown();
    }

    #[test]
    fn test_task_counts_failures() {
        let task = ReconnectTask::new(Endpoint::new("a:1"));
        assert_eq!(task.record_failure(), 1);
        assert_eq!(task.record_failure(), 2);
        assert_eq!(task.attempt(), 2);
        task.stop();
        assert!(task.is_stopped());
    }
}
