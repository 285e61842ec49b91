use crate::handler::backoff::{BackoffConfig, KeyedBackoff};
use crate::resource::ObjectId;

use prometheus::IntGauge;
use tokio::sync::Notify;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long an idle `get` waits before re-checking for shutdown
const IDLE_RECHECK: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectId>,
    /// keys that need processing, whether queued or waiting for a worker to finish with them
    dirty: HashSet<ObjectId>,
    processing: HashSet<ObjectId>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: KeyedBackoff<ObjectId>,
    depth: Option<IntGauge>,
}

/// A work queue keyed by object id. Adding a key that is already waiting is a no-op, and a key
/// is never handed to two workers at once: adding a key while it's being processed defers it
/// until `done` is called for it.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "WorkQueue(len: {})", self.len())
    }
}

impl WorkQueue {
    pub fn new(rate_limit: BackoffConfig) -> WorkQueue {
        WorkQueue::with_depth_gauge(rate_limit, None)
    }

    pub fn with_depth_gauge(rate_limit: BackoffConfig, depth: Option<IntGauge>) -> WorkQueue {
        WorkQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                rate_limiter: KeyedBackoff::new(rate_limit),
                depth,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update_depth(&self, state: &QueueState) {
        if let Some(gauge) = self.inner.depth.as_ref() {
            gauge.set(state.queue.len() as i64);
        }
    }

    pub fn add(&self, key: ObjectId) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.update_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds the key once the delay has passed. Must be called from within a tokio runtime.
    pub fn add_after(&self, key: ObjectId, delay: Duration) {
        if delay == Duration::from_secs(0) {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds the key after its next backoff. Backoffs grow with each call until `forget`.
    pub fn add_rate_limited(&self, key: ObjectId) {
        let delay = self
            .inner
            .rate_limiter
            .next_backoff(&key)
            .unwrap_or(self.inner.rate_limiter.config().max_interval);
        log::debug!("Requeueing {} with backoff of {}ms", key, delay.as_millis());
        self.add_after(key, delay);
    }

    /// Clears the rate limiting history of the key
    pub fn forget(&self, key: &ObjectId) {
        self.inner.rate_limiter.reset(key);
    }

    pub fn num_requeues(&self, key: &ObjectId) -> u32 {
        self.inner.rate_limiter.attempts(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down. Every key returned
    /// must be passed to `done` when the worker is finished with it.
    pub async fn get(&self) -> Option<ObjectId> {
        loop {
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.update_depth(&state);
                    return Some(key);
                }
            }
            let _ = tokio::time::timeout(IDLE_RECHECK, self.inner.notify.notified()).await;
        }
    }

    pub fn done(&self, key: &ObjectId) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            self.update_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys. Keys that are still queued are dropped, and picked up again by
    /// the initial list after the next start.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(BackoffConfig::fixed_interval(Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn repeated_adds_are_coalesced() {
        let queue = queue();
        let key = ObjectId::new("ns", "a");
        queue.add(key.clone());
        queue.add(key.clone());
        queue.add(ObjectId::new("ns", "b"));
        assert_eq!(2, queue.len());
        assert_eq!(Some(key), queue.get().await);
    }

    #[tokio::test]
    async fn keys_being_processed_are_deferred_until_done() {
        let queue = queue();
        let key = ObjectId::new("ns", "a");
        queue.add(key.clone());
        let got = queue.get().await.unwrap();
        assert_eq!(key, got);

        queue.add(key.clone());
        assert!(queue.is_empty());

        queue.done(&got);
        assert_eq!(1, queue.len());
        assert_eq!(Some(key.clone()), queue.get().await);
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn delayed_and_rate_limited_adds_arrive_later() {
        let queue = queue();
        let key = ObjectId::cluster("broker");
        queue.add_after(key.clone(), Duration::from_millis(20));
        assert!(queue.is_empty());
        assert_eq!(Some(key.clone()), queue.get().await);
        queue.done(&key);

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(2, queue.num_requeues(&key));
        assert_eq!(Some(key.clone()), queue.get().await);
        queue.forget(&key);
        assert_eq!(0, queue.num_requeues(&key));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        assert_eq!(None, waiter.await.unwrap());

        queue.add(ObjectId::new("ns", "late"));
        assert!(queue.is_empty());
    }
}
