//! Log dispatcher
//!
//! Connection handlers push outcomes into a bounded in-memory queue without
//! ever waiting. A single consumer task drains it into an [`OutcomeSink`];
//! failed deliveries go back to the tail of the queue and the consumer pauses
//! before the next attempt. Delivery is at-least-once and unordered.

mod sink;

pub use sink::{DeliveryError, HttpLogSink, OutcomeSink};

use crate::config::DispatcherConfig;
use crate::models::ConnectionOutcome;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// What to discard when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued outcome to make room
    #[default]
    DropOldest,
    /// Discard the outcome being pushed
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" | "drop_newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!(
                "unknown overflow policy '{other}' (expected 'drop-oldest' or 'drop-newest')"
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => f.write_str("drop-oldest"),
            OverflowPolicy::DropNewest => f.write_str("drop-newest"),
        }
    }
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStats {
    /// Outcomes accepted from connection handlers
    pub enqueued: u64,
    /// Successful deliveries, duplicates included
    pub delivered: u64,
    /// Delivery attempts that failed and were re-queued
    pub failed_attempts: u64,
    /// Outcomes discarded by the overflow policy
    pub dropped: u64,
    /// Outcomes currently waiting in the queue
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
}

pub struct LogDispatcher {
    queue: Mutex<VecDeque<ConnectionOutcome>>,
    notify: Notify,
    config: DispatcherConfig,
    counters: Counters,
}

impl LogDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            config,
            counters: Counters::default(),
        }
    }

    /// Queue an outcome for delivery. Never waits.
    pub fn enqueue(&self, outcome: ConnectionOutcome) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.push(outcome);
    }

    /// Put a failed outcome back at the tail
    fn requeue(&self, outcome: ConnectionOutcome) {
        self.push(outcome);
    }

    fn push(&self, outcome: ConnectionOutcome) {
        let dropped = {
            let mut queue = self.lock_queue();
            if queue.len() < self.config.capacity {
                queue.push_back(outcome);
                None
            } else {
                match self.config.overflow {
                    OverflowPolicy::DropOldest => {
                        let evicted = queue.pop_front();
                        queue.push_back(outcome);
                        evicted
                    }
                    OverflowPolicy::DropNewest => Some(outcome),
                }
            }
        };

        if let Some(lost) = dropped {
            let total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                "Log queue full ({}), dropped {} outcome for {} ({} dropped so far)",
                self.config.capacity,
                lost.status,
                lost.domain,
                total
            );
        }
        self.notify.notify_one();
    }

    /// Wait up to `timeout` for the next queued outcome
    pub async fn dequeue(&self, timeout: Duration) -> Option<ConnectionOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.lock_queue().pop_front() {
                return Some(outcome);
            }
            if time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.lock_queue().pop_front();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<ConnectionOutcome>> {
        // Queue operations cannot leave the deque half-modified
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the single consumer that drains the queue into `sink`
    pub fn spawn_consumer(
        self: &Arc<Self>,
        sink: Arc<dyn OutcomeSink>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            let dequeue_timeout = dispatcher.config.dequeue_timeout;
            let backoff = dispatcher.config.retry_backoff;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let next = tokio::select! {
                    item = dispatcher.dequeue(dequeue_timeout) => item,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                let Some(outcome) = next else {
                    continue;
                };

                match sink.deliver(&outcome).await {
                    Ok(()) => {
                        dispatcher.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Delivered {} log for {}", outcome.status, outcome.domain);
                    }
                    Err(e) => {
                        dispatcher
                            .counters
                            .failed_attempts
                            .fetch_add(1, Ordering::Relaxed);
                        dispatcher.requeue(outcome);
                        tracing::warn!(
                            "Log send failed, {} queued for retry: {}",
                            dispatcher.pending(),
                            e
                        );

                        tokio::select! {
                            _ = time::sleep(backoff) => {}
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            let pending = dispatcher.pending();
            if pending > 0 {
                tracing::warn!("Log dispatcher stopped with {} undelivered outcomes", pending);
            } else {
                tracing::debug!("Log dispatcher stopped");
            }
        })
    }
}
