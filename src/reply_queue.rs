//! FIFO handoff of decoded replies from the background reader to callers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

/// Unbounded, order-preserving reply queue.
///
/// The background reader pushes decoded reply objects as they arrive;
/// foreground callers consume them with a blocking timeout. Objects are
/// delivered in exactly the order they were decoded. There is no filtering
/// or priority: the wire carries no request/reply correlation id, so a
/// caller expecting a specific reply inspects each object and discards the
/// ones it does not recognize. Unrelated status frames consumed this way
/// are lost to other consumers, an accepted protocol constraint.
#[derive(Debug, Clone, Default)]
pub struct ReplyQueue {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    queue: Mutex<VecDeque<Value>>,
    available: Condvar,
}

impl ReplyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue a decoded reply. Never blocks.
    pub(crate) fn push(&self, reply: Value) {
        self.lock().push_back(reply);
        self.inner.available.notify_one();
    }

    /// Dequeue the oldest undelivered reply, waiting up to `timeout`.
    ///
    /// Returns `None` if nothing arrived within the bound.
    pub fn get(&self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(reply) = queue.pop_front() {
                return Some(reply);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(queue, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue = guard;
        }
    }

    /// Remove and discard everything currently queued, without blocking.
    ///
    /// Used before operations that are sensitive to stale replies, such as
    /// a streaming handshake. Returns the number of discarded objects.
    pub fn drain(&self) -> usize {
        let mut queue = self.lock();
        let discarded = queue.len();
        queue.clear();
        discarded
    }

    /// Number of replies currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Value>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
