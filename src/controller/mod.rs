//! Reconciler worker loop
//!
//! Workers pull keys from a [`WorkQueue`], read the current object from the
//! cache and hand it to a [`Reconcile`] implementation. Failures are retried
//! with per-key exponential backoff up to `max_num_requeues`, then dropped and
//! reported. Same-key exclusivity comes from the queue alone; workers take no
//! locks.

mod injector;

pub use injector::{decide, find_matching_backup, Apis, Injector, SidecarAction};

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::ObjectKey;
use crate::cache::ObjectCache;
use crate::queue::WorkQueue;
use crate::Error;

/// Brings one object to its desired state
#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    /// Reconcile the current state of `obj`
    async fn reconcile(&self, obj: Arc<K>) -> Result<(), Error>;
}

/// Receives errors for keys dropped after exhausting their requeues
#[cfg_attr(test, automock)]
pub trait ErrorReporter: Send + Sync {
    /// Report that `key` was dropped because of `error`
    fn report(&self, key: &ObjectKey, error: &Error);
}

/// Reports dropped keys through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, key: &ObjectKey, error: &Error) {
        let mut chain = error.to_string();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        error!(key = %key, error = %chain, "dropping key out of the queue");
    }
}

/// Releases a key handed out by the queue, even if the reconcile panics
struct InFlight<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: ObjectKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

/// Worker pool for one object kind
pub struct Controller<K> {
    queue: WorkQueue<ObjectKey>,
    cache: Arc<dyn ObjectCache<K>>,
    reconciler: Arc<dyn Reconcile<K>>,
    reporter: Arc<dyn ErrorReporter>,
    max_num_requeues: u32,
}

impl<K> Controller<K>
where
    K: Send + Sync + 'static,
{
    /// Create a controller draining `queue`
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        cache: Arc<dyn ObjectCache<K>>,
        reconciler: Arc<dyn Reconcile<K>>,
        reporter: Arc<dyn ErrorReporter>,
        max_num_requeues: u32,
    ) -> Self {
        Self {
            queue,
            cache,
            reconciler,
            reporter,
            max_num_requeues,
        }
    }

    /// The queue this controller drains
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Run `workers` workers until the queue shuts down and drains.
    ///
    /// A worker that panics is replaced, so the pool keeps its size. The key
    /// it was holding is released and waits for its next notification.
    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(queue = %self.queue.name(), workers, "starting workers");
        let mut set = JoinSet::new();
        for _ in 0..workers {
            self.spawn_worker(&mut set);
        }
        while let Some(res) = set.join_next().await {
            let Err(e) = res else { continue };
            error!(queue = %self.queue.name(), error = %e, "worker exited abnormally");
            if e.is_panic() && !self.queue.is_shutting_down() {
                self.spawn_worker(&mut set);
            }
        }
        info!(queue = %self.queue.name(), "workers stopped");
    }

    fn spawn_worker(self: &Arc<Self>, set: &mut JoinSet<()>) {
        let controller = self.clone();
        set.spawn(async move { while controller.process_next_item().await {} });
    }

    /// Process one key. Returns false once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let guard = InFlight {
            queue: &self.queue,
            key,
        };

        let result = self.sync(&guard.key).await;
        self.handle_result(&guard.key, result);
        true
    }

    async fn sync(&self, key: &ObjectKey) -> Result<(), Error> {
        match self.cache.get(key) {
            Some(obj) => self.reconciler.reconcile(obj).await,
            None => {
                info!(queue = %self.queue.name(), key = %key, "object no longer exists");
                Ok(())
            }
        }
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<(), Error>) {
        let Err(err) = result else {
            debug!(queue = %self.queue.name(), key = %key, "reconciled");
            self.queue.forget(key);
            return;
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_num_requeues {
            warn!(
                queue = %self.queue.name(),
                key = %key,
                requeues,
                error = %err,
                "reconcile failed, requeueing"
            );
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        self.reporter.report(key, &err);
    }
}
