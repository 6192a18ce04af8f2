//! Resource Cache and event wiring
//!
//! Each watched kind is mirrored into a kube-rs reflector [`Store`]. Watch
//! events are reduced to object keys and pushed onto a [`WorkQueue`]; workers
//! never see event payloads and always read the current object back from the
//! store.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::api::{kind_of, ObjectKey};
use crate::queue::WorkQueue;

/// Read access to a locally mirrored collection
pub trait ObjectCache<K>: Send + Sync {
    /// Object by namespace and name
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;

    /// All objects, or only those in `namespace`
    fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>>;
}

impl<K> ObjectCache<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        self.state()
            .into_iter()
            .filter(|obj| namespace.is_none_or(|ns| obj.namespace().as_deref() == Some(ns)))
            .collect()
    }
}

/// Key of the object an event is about. Init markers carry no object.
pub fn event_key<K: Resource>(event: &Event<K>) -> Option<ObjectKey> {
    match event {
        Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => Some(ObjectKey::of(obj)),
        Event::Init | Event::InitDone => None,
    }
}

/// Mirror `api` into `writer` and enqueue the key of every changed object.
///
/// Runs until the watch stream ends, which only happens when the task is
/// aborted.
pub async fn run_informer<K>(
    api: Api<K>,
    writer: reflector::store::Writer<K>,
    queue: WorkQueue<ObjectKey>,
) where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let stream = watch_stream(api).reflect(writer);
    drive(stream, |key| queue.add(key)).await;
    info!(kind = %kind_of::<K>(), "informer stopped");
}

/// Mirror `api` into `writer` and call `on_change(namespace)` for every
/// changed object.
pub async fn run_namespace_informer<K, F>(
    api: Api<K>,
    writer: reflector::store::Writer<K>,
    on_change: F,
) where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&str),
{
    let stream = watch_stream(api).reflect(writer);
    drive(stream, |key| on_change(&key.namespace)).await;
    info!(kind = %kind_of::<K>(), "informer stopped");
}

fn watch_stream<K>(api: Api<K>) -> impl Stream<Item = Result<Event<K>, watcher::Error>>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

async fn drive<K, S, F>(stream: S, mut on_key: F)
where
    K: Resource<DynamicType = ()>,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(ObjectKey),
{
    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let Some(key) = event_key(&event) {
                    debug!(kind = %kind_of::<K>(), key = %key, "watch event");
                    on_key(key);
                }
            }
            Err(e) => warn!(kind = %kind_of::<K>(), error = %e, "watch stream error, retrying"),
        }
    }
}

// =============================================================================
// Fan-out and resync
// =============================================================================

/// Re-enqueues cached objects of one kind in bulk
pub trait Requeue: Send + Sync {
    /// Enqueue every cached object in `namespace`
    fn requeue_namespace(&self, namespace: &str);

    /// Enqueue every cached object
    fn requeue_all(&self);
}

/// A kind's cache paired with its queue
pub struct CachedQueue<K> {
    cache: Arc<dyn ObjectCache<K>>,
    queue: WorkQueue<ObjectKey>,
}

impl<K> CachedQueue<K> {
    /// Pair a cache with the queue its informer feeds
    pub fn new(cache: Arc<dyn ObjectCache<K>>, queue: WorkQueue<ObjectKey>) -> Self {
        Self { cache, queue }
    }
}

impl<K> CachedQueue<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn requeue(&self, namespace: Option<&str>) {
        let objects = self.cache.list(namespace);
        debug!(
            kind = %kind_of::<K>(),
            namespace = namespace.unwrap_or("*"),
            count = objects.len(),
            "requeueing cached objects"
        );
        for obj in objects {
            self.queue.add(ObjectKey::of(obj.as_ref()));
        }
    }
}

impl<K> Requeue for CachedQueue<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn requeue_namespace(&self, namespace: &str) {
        self.requeue(Some(namespace));
    }

    fn requeue_all(&self) {
        self.requeue(None);
    }
}

/// Every `period`, re-enqueue everything the caches hold.
///
/// The first tick fires after one full period; initial keys come from the
/// informers' initial list.
pub async fn run_resync(targets: Vec<Arc<dyn Requeue>>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        debug!("periodic resync");
        for target in &targets {
            target.requeue_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;

    fn deployment(namespace: &str, name: &str) -> Deployment {
        let mut deploy = Deployment::default();
        deploy.metadata.name = Some(name.to_string());
        deploy.metadata.namespace = Some(namespace.to_string());
        deploy
    }

    fn store_with(objects: &[Deployment]) -> Store<Deployment> {
        let (store, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&Event::Apply(obj.clone()));
        }
        store
    }

    #[test]
    fn store_lookup_by_key() {
        let store = store_with(&[deployment("default", "web"), deployment("prod", "web")]);
        let cache: &dyn ObjectCache<Deployment> = &store;

        let found = cache.get(&ObjectKey::new("prod", "web")).unwrap();
        assert_eq!(found.metadata.namespace.as_deref(), Some("prod"));
        assert!(cache.get(&ObjectKey::new("staging", "web")).is_none());
    }

    #[test]
    fn store_list_filters_by_namespace() {
        let store = store_with(&[
            deployment("default", "web"),
            deployment("default", "db"),
            deployment("prod", "web"),
        ]);
        let cache: &dyn ObjectCache<Deployment> = &store;

        assert_eq!(cache.list(None).len(), 3);
        assert_eq!(cache.list(Some("default")).len(), 2);
        assert!(cache.list(Some("staging")).is_empty());
    }

    #[test]
    fn events_reduce_to_keys() {
        let web = deployment("default", "web");
        assert_eq!(
            event_key(&Event::Apply(web.clone())),
            Some(ObjectKey::new("default", "web"))
        );
        assert_eq!(
            event_key(&Event::Delete(web.clone())),
            Some(ObjectKey::new("default", "web"))
        );
        assert_eq!(
            event_key(&Event::InitApply(web)),
            Some(ObjectKey::new("default", "web"))
        );
        assert_eq!(event_key::<Deployment>(&Event::Init), None);
        assert_eq!(event_key::<Deployment>(&Event::InitDone), None);
    }

    #[tokio::test]
    async fn drive_forwards_keys_and_survives_errors() {
        let events = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(deployment("default", "web"))),
            Ok(Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::Delete(deployment("default", "db"))),
        ];
        let mut keys = Vec::new();
        drive(futures::stream::iter(events), |key| keys.push(key)).await;
        assert_eq!(
            keys,
            vec![ObjectKey::new("default", "web"), ObjectKey::new("default", "db")]
        );
    }

    #[tokio::test]
    async fn namespace_requeue_only_touches_that_namespace() {
        let store = store_with(&[
            deployment("default", "web"),
            deployment("default", "db"),
            deployment("prod", "web"),
        ]);
        let queue = WorkQueue::new("deployments");
        let fanout = CachedQueue::<Deployment>::new(Arc::new(store), queue.clone());

        fanout.requeue_namespace("default");
        assert_eq!(queue.len(), 2);

        fanout.requeue_all();
        // Already pending keys collapse
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_requeues_every_period() {
        let store = store_with(&[deployment("default", "web")]);
        let queue = WorkQueue::new("deployments");
        let target: Arc<dyn Requeue> =
            Arc::new(CachedQueue::<Deployment>::new(Arc::new(store), queue.clone()));

        let handle = tokio::spawn(run_resync(vec![target], Duration::from_secs(300)));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        handle.abort();
    }
}
