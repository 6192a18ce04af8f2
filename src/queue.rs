//! Change Notification Queue
//!
//! A deduplicating, rate-limited work queue of object keys. Keys carry identity
//! only; workers always re-read the object from the cache.
//!
//! Guarantees:
//! - A key added several times before a worker picks it up is handed out once.
//! - A key handed out by [`WorkQueue::get`] is not handed out again until
//!   [`WorkQueue::done`] is called for it. If it was re-added in between, it
//!   becomes eligible again as soon as it is released.
//! - [`WorkQueue::add_rate_limited`] delays re-delivery exponentially in the
//!   number of requeues recorded for the key; [`WorkQueue::forget`] resets it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::retry::ExponentialBackoff;

/// Shared handle to a work queue. Cloning is cheap.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    name: String,
    backoff: ExponentialBackoff,
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    /// Keys ready to be handed out, in arrival order
    queue: VecDeque<K>,
    /// Keys waiting to be processed (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Requeue counts for rate limiting
    requeues: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a named queue with the default backoff (5ms doubling, capped at 1000s)
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, ExponentialBackoff::default())
    }

    /// Create a named queue with a custom backoff
    pub fn with_backoff(name: impl Into<String>, backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                backoff,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a key unless it is already pending
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(queue = %self.inner.name, key = ?key, "key already pending");
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key after `delay`
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.inner.state.lock().shutting_down {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key after a backoff derived from its requeue count
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let requeues = state.requeues.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*requeues);
            *requeues += 1;
            delay
        };
        trace!(queue = %self.inner.name, key = ?key, delay_ms = delay.as_millis(), "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Number of times the key has been requeued through [`Self::add_rate_limited`]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Reset the requeue count for a key
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().requeues.remove(key);
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down and no keys remain.
    /// The returned key must be released with [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by [`Self::get`]
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`Self::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no keys are waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("default/web".to_string());
        queue.add("default/web".to_string());
        queue.add("default/db".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
        assert_eq!(queue.get().await.as_deref(), Some("default/db"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new("test");
        queue.add("default/web".to_string());

        let key = queue.get().await.unwrap();
        queue.add(key.clone());

        // Re-added while processing: parked until done()
        assert!(queue.is_empty());
        assert!(timeout(SHORT, queue.get()).await.is_err());

        queue.done(&key);
        assert_eq!(queue.get().await, Some(key));
    }

    #[tokio::test]
    async fn done_without_readd_drops_the_key() {
        let queue = WorkQueue::new("test");
        queue.add("default/web".to_string());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_when_a_key_arrives() {
        let queue = WorkQueue::new("test");
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(7u32);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn every_waiting_worker_receives_a_key() {
        let queue = WorkQueue::new("test");
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        for key in 0..3u32 {
            queue.add(key);
        }

        let mut got = Vec::new();
        for waiter in waiters {
            got.push(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap());
        }
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_backs_off_exponentially() {
        let queue = WorkQueue::with_backoff(
            "test",
            ExponentialBackoff {
                base: Duration::from_millis(100),
                max: Duration::from_secs(10),
            },
        );
        let key = "default/web".to_string();

        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);

        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.is_empty(), "second requeue waits 200ms");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let queue = WorkQueue::new("test");
        let key = "default/web".to_string();
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);
        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_workers() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_drains_pending_keys_then_stops() {
        let queue = WorkQueue::new("test");
        queue.add(1u32);
        queue.shut_down();
        queue.add(2u32);

        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, None);
    }
}
