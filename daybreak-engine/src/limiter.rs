//! Per-alarm request throttle and batching window.
//!
//! Pure bookkeeping: the limiter never touches the network. It bounds how
//! often each alarm may hit the external calculation service, and coalesces
//! bursts of near-simultaneous requests into one "batch ready" flush that
//! the coordinator consumes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::tracing::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Requests allowed per alarm within the trailing interval.
    pub max_requests_per_interval: usize,
    /// Trailing window length.
    pub interval: Duration,
    /// How long to hold a queued request open for coalescing.
    pub batch_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests_per_interval: 1,
            interval: Duration::from_secs(15 * 60),
            batch_window: Duration::from_secs(2),
        }
    }
}

struct Inner {
    /// Request timestamps per alarm, pruned lazily on every call.
    history: HashMap<Uuid, Vec<Instant>>,
    /// Queued alarm ids awaiting the batch timer, deduplicated.
    pending: Vec<Uuid>,
    /// The current batch timer, restarted on every queue.
    timer: Option<AbortHandle>,
}

/// Shared request throttle.
///
/// One instance per process; the coordinator and the refresh loop both
/// call into it, so all state sits behind one mutex.
pub struct RateLimiter {
    config: LimiterConfig,
    inner: Mutex<Inner>,
    batch_tx: mpsc::Sender<Vec<Uuid>>,
    /// Back-reference handed to spawned batch timers.
    weak: Weak<RateLimiter>,
}

impl RateLimiter {
    /// Create the limiter and the receiving end of its batch-ready signal.
    pub fn new(config: LimiterConfig) -> (Arc<Self>, mpsc::Receiver<Vec<Uuid>>) {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let limiter = Arc::new_cyclic(|weak| Self {
            config,
            inner: Mutex::new(Inner {
                history: HashMap::new(),
                pending: Vec::new(),
                timer: None,
            }),
            batch_tx,
            weak: weak.clone(),
        });
        (limiter, batch_rx)
    }

    /// Whether this alarm may make a request right now.
    pub fn can_make_request(&self, alarm_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, alarm_id);
        self.in_window(&inner, alarm_id) < self.config.max_requests_per_interval
    }

    /// Record that a request was made for this alarm.
    pub fn record_request(&self, alarm_id: Uuid) {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, alarm_id);
        inner.history.entry(alarm_id).or_default().push(Instant::now());
    }

    /// Remaining cooldown before this alarm may request again, or `None`
    /// when a request is currently allowed.
    pub fn time_until_next_request(&self, alarm_id: Uuid) -> Option<Duration> {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, alarm_id);
        if self.in_window(&inner, alarm_id) < self.config.max_requests_per_interval {
            return None;
        }
        let oldest = inner.history.get(&alarm_id)?.iter().min()?;
        Some(self.config.interval.saturating_sub(oldest.elapsed()))
    }

    /// Queue a request for the next batch flush.
    ///
    /// Returns `false` immediately when the alarm is over its window.
    /// Otherwise the request slot is reserved (counted against the window)
    /// and the batch timer is (re)started; on fire, the deduplicated queue
    /// is sent as one batch. Consumers of the batch must not re-check the
    /// limiter, the slot is already taken.
    pub fn queue_request(&self, alarm_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, alarm_id);
        if self.in_window(&inner, alarm_id) >= self.config.max_requests_per_interval {
            debug!(alarm_id = %alarm_id, "Request rate limited");
            return false;
        }

        inner.history.entry(alarm_id).or_default().push(Instant::now());
        if !inner.pending.contains(&alarm_id) {
            inner.pending.push(alarm_id);
        }

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let Some(this) = self.weak.upgrade() else {
            return true;
        };
        let window = self.config.batch_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.flush().await;
        });
        inner.timer = Some(handle.abort_handle());

        true
    }

    async fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock();
            inner.timer = None;
            std::mem::take(&mut inner.pending)
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "Flushing calculation request batch");
        if self.batch_tx.send(batch).await.is_err() {
            debug!("Batch channel closed, dropping flush");
        }
    }

    fn prune(&self, inner: &mut Inner, alarm_id: Uuid) {
        if let Some(timestamps) = inner.history.get_mut(&alarm_id) {
            timestamps.retain(|t| t.elapsed() < self.config.interval);
            if timestamps.is_empty() {
                inner.history.remove(&alarm_id);
            }
        }
    }

    fn in_window(&self, inner: &Inner, alarm_id: Uuid) -> usize {
        inner.history.get(&alarm_id).map_or(0, Vec::len)
    }
}
