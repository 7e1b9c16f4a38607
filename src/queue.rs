//! Rate-limited, deduplicating queue of evaluation states.
//!
//! Every item is keyed by its invocation id and is in exactly one of
//! three places: pending (queued or waiting out a delay), in flight,
//! or absent. Re-adding a pending key is a no-op. Re-adding a key that
//! is in flight marks it dirty; `done` re-queues it immediately.
//! Per-key failure counters grow an exponential delay consumed by
//! `add_rate_limited`; `forget` resets them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::eval::EvalState;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_CEILING: Duration = Duration::from_secs(1000);

struct Waiting {
    ready_at: Instant,
    id: Uuid,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.id == other.id
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Uuid>,
    items: HashMap<Uuid, Arc<EvalState>>,
    dirty: HashSet<Uuid>,
    processing: HashSet<Uuid>,
    delayed: HashSet<Uuid>,
    waiting: BinaryHeap<Waiting>,
    failures: HashMap<Uuid, u32>,
    shutdown: bool,
}

impl Inner {
    fn add_locked(&mut self, state: Arc<EvalState>) {
        let id = state.invocation_id();
        self.items.insert(id, state);
        if !self.dirty.insert(id) {
            return;
        }
        if self.processing.contains(&id) {
            // Re-queued by `done` once the current pass releases it.
            return;
        }
        self.queue.push_back(id);
        metrics::gauge!("headway_eval_queue_depth").increment(1.0);
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(waiting) = self.waiting.peek() {
            if waiting.ready_at > now {
                break;
            }
            let waiting = self.waiting.pop().expect("peeked entry present");
            self.delayed.remove(&waiting.id);
            if let Some(state) = self.items.get(&waiting.id).cloned() {
                self.add_locked(state);
            }
        }
    }
}

/// Work queue feeding the evaluation worker loop.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a state for evaluation. No-op if it is already pending.
    pub fn add(&self, state: Arc<EvalState>) {
        {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            if inner.shutdown {
                return;
            }
            inner.add_locked(state);
        }
        self.notify.notify_one();
    }

    /// Enqueue a state once `delay` has elapsed. An earlier pending
    /// entry for the same key absorbs this call.
    pub fn add_after(&self, state: Arc<EvalState>, delay: Duration) {
        if delay.is_zero() {
            self.add(state);
            return;
        }
        {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            if inner.shutdown {
                return;
            }
            let id = state.invocation_id();
            inner.items.insert(id, state);
            if inner.dirty.contains(&id) || !inner.delayed.insert(id) {
                return;
            }
            inner.waiting.push(Waiting {
                ready_at: Instant::now() + delay,
                id,
            });
        }
        // Wake the getter so it recomputes its sleep deadline.
        self.notify.notify_one();
    }

    /// Enqueue with the key's current backoff delay, then grow it.
    pub fn add_rate_limited(&self, state: Arc<EvalState>) {
        let delay = {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            let id = state.invocation_id();
            let retries = inner.failures.entry(id).or_insert(0);
            let delay = backoff_delay(*retries);
            *retries = retries.saturating_add(1);
            delay
        };
        self.add_after(state, delay);
    }

    /// Reset the key's backoff counters.
    pub fn forget(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("work queue poisoned");
        inner.failures.remove(&id);
    }

    /// Release the in-flight marker for a key. If the key was re-added
    /// while it was being processed it goes straight back in the queue.
    pub fn done(&self, id: Uuid) {
        let requeued = {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            inner.processing.remove(&id);
            if inner.dirty.contains(&id) {
                inner.queue.push_back(id);
                metrics::gauge!("headway_eval_queue_depth").increment(1.0);
                true
            } else {
                if !inner.delayed.contains(&id) {
                    inner.items.remove(&id);
                }
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Wait for the next item. Marks it in flight; the caller must
    /// pair this with [`done`](Self::done). Returns `None` once the
    /// queue has shut down.
    pub async fn get(&self) -> Option<Arc<EvalState>> {
        loop {
            let notified = self.notify.notified();
            let next_due = {
                let mut inner = self.inner.lock().expect("work queue poisoned");
                inner.promote_due(Instant::now());
                if let Some(id) = inner.queue.pop_front() {
                    inner.dirty.remove(&id);
                    inner.processing.insert(id);
                    metrics::gauge!("headway_eval_queue_depth").decrement(1.0);
                    let state = inner
                        .items
                        .get(&id)
                        .cloned()
                        .expect("queued key has an item");
                    return Some(state);
                }
                if inner.shutdown {
                    return None;
                }
                inner.waiting.peek().map(|w| w.ready_at)
            };
            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Pending items (queued plus waiting out a delay).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("work queue poisoned");
        inner.queue.len() + inner.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and unblock all getters.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            inner.shutdown = true;
        }
        self.notify.notify_waiters();
        // notify_waiters only reaches registered waiters; the stored
        // permit covers a getter that has not polled yet.
        self.notify.notify_one();
    }
}

fn backoff_delay(retries: u32) -> Duration {
    let exp = retries.min(24);
    let millis = (BACKOFF_BASE.as_millis() as u64) << exp;
    Duration::from_millis(millis).min(BACKOFF_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalStore;
    use std::time::Duration;

    fn state_for(store: &EvalStore, id: Uuid) -> Arc<EvalState> {
        store.load_or_store(id, tracing::Span::none()).0
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(5));
        assert_eq!(backoff_delay(1), Duration::from_millis(10));
        assert_eq!(backoff_delay(4), Duration::from_millis(80));
        assert_eq!(backoff_delay(40), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn add_deduplicates_pending_items() {
        let store = EvalStore::new();
        let queue = WorkQueue::new();
        let state = state_for(&store, Uuid::new_v4());

        queue.add(Arc::clone(&state));
        queue.add(Arc::clone(&state));
        queue.add(state);

        assert_eq!(queue.len(), 1);
        queue.get().await.expect("one item");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn readd_during_processing_requeues_on_done() {
        let store = EvalStore::new();
        let queue = WorkQueue::new();
        let id = Uuid::new_v4();
        let state = state_for(&store, id);

        queue.add(Arc::clone(&state));
        let in_flight = queue.get().await.expect("item");
        assert_eq!(in_flight.invocation_id(), id);

        queue.add(Arc::clone(&state));
        assert_eq!(queue.len(), 0, "in-flight re-add must not double-queue");

        queue.done(id);
        assert_eq!(queue.len(), 1, "release must re-queue the dirty item");
        queue.get().await.expect("requeued item");
    }

    #[tokio::test]
    async fn add_after_delays_eligibility() {
        let store = EvalStore::new();
        let queue = WorkQueue::new();
        let state = state_for(&store, Uuid::new_v4());

        let start = Instant::now();
        queue.add_after(state, Duration::from_millis(50));
        queue.get().await.expect("delayed item");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn rate_limit_counters_grow_until_forgotten() {
        let store = EvalStore::new();
        let queue = WorkQueue::new();
        let id = Uuid::new_v4();
        let state = state_for(&store, id);

        // First rate-limited add uses the base delay.
        let start = Instant::now();
        queue.add_rate_limited(Arc::clone(&state));
        queue.get().await.expect("item");
        assert!(start.elapsed() >= Duration::from_millis(5));
        queue.done(id);

        // Second add doubles it.
        let start = Instant::now();
        queue.add_rate_limited(Arc::clone(&state));
        queue.get().await.expect("item");
        assert!(start.elapsed() >= Duration::from_millis(10));
        queue.done(id);

        // Grow the failure counter well past the point where the
        // delay would dominate the test, then reset it.
        for _ in 0..6 {
            queue.add_rate_limited(Arc::clone(&state));
        }
        queue.get().await.expect("item");
        queue.done(id);
        queue.forget(id);

        // A forgotten key is back at the base delay (the unforgotten
        // delay at this point would exceed a second).
        let start = Instant::now();
        queue.add_rate_limited(state);
        queue.get().await.expect("item");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5));
        assert!(elapsed < Duration::from_millis(500));
        queue.done(id);
    }

    #[tokio::test]
    async fn shutdown_unblocks_getters() {
        let queue = Arc::new(WorkQueue::new());
        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();
        let item = getter.await.expect("getter joined");
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_items() {
        let store = EvalStore::new();
        let queue = WorkQueue::new();
        queue.shut_down();
        queue.add(state_for(&store, Uuid::new_v4()));
        assert!(queue.is_empty());
    }
}
