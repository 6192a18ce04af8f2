//! Typed access to namespaced cluster objects
//!
//! [`ObjectApi`] is the capability set the Patch Engine, RBAC and readiness
//! code are written against. [`KubeApi`] is the production implementation on
//! top of a kube-rs [`Client`]; tests use the in-memory
//! [`testing::FakeApi`], which doubles as an in-memory object cache.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "backup-sidecar-operator";

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object. Objects without a namespace get `default`.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kind name of a statically typed resource
pub fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

/// Operations the controller needs on one namespaced object kind.
///
/// Every method maps API failures through [`Error::from_kube`], so a missing
/// object is always [`Error::NotFound`].
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// Fetch an object
    async fn get(&self, key: &ObjectKey) -> Result<K, Error>;

    /// Create an object
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Apply a JSON merge patch
    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, Error>;

    /// Replace an object (optimistic concurrency on resourceVersion)
    async fn update(&self, obj: &K) -> Result<K, Error>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;

    /// List objects in a namespace matching a label selector string
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error>;
}

/// [`ObjectApi`] backed by the Kubernetes API server
pub struct KubeApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeApi<K> {
    /// Create a new KubeApi wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_err(key: &ObjectKey, err: kube::Error) -> Error {
        Error::from_kube(&kind_of::<K>(), &key.namespace, &key.name, err)
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, Error> {
        self.api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&key.namespace)
            .create(&params, obj)
            .await
            .map_err(|e| Self::map_err(&key, e))
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, Error> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&key.namespace)
            .patch(&key.name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&key.namespace)
            .replace(&key.name, &params, obj)
            .await
            .map_err(|e| Self::map_err(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(key, e))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(label_selector);
        self.api(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| Self::map_err(&ObjectKey::new(namespace, "*"), e))
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory [`ObjectApi`] for tests
    #![allow(missing_docs)]

    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::cache::ObjectCache;

    type WriteHook<K> = Arc<dyn Fn(&mut K) + Send + Sync>;

    /// Which call an injected failure applies to
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Op {
        Get,
        Create,
        Patch,
        Update,
        Delete,
        List,
    }

    /// Stores objects as values, applies merge patches with `json_patch::merge`,
    /// and counts writes.
    pub struct FakeApi<K> {
        objects: Mutex<BTreeMap<ObjectKey, K>>,
        failures: Mutex<VecDeque<(Op, Error)>>,
        writes: AtomicUsize,
        patches: Mutex<Vec<serde_json::Value>>,
        on_write: Mutex<Option<WriteHook<K>>>,
    }

    impl<K> Default for FakeApi<K> {
        fn default() -> Self {
            Self {
                objects: Mutex::new(BTreeMap::new()),
                failures: Mutex::new(VecDeque::new()),
                writes: AtomicUsize::new(0),
                patches: Mutex::new(Vec::new()),
                on_write: Mutex::new(None),
            }
        }
    }

    impl<K> FakeApi<K>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
            let api = Self::new();
            for obj in objects {
                api.insert(obj);
            }
            api
        }

        /// Seed or overwrite an object without counting a write
        pub fn insert(&self, obj: K) {
            self.objects.lock().insert(ObjectKey::of(&obj), obj);
        }

        pub fn remove(&self, key: &ObjectKey) {
            self.objects.lock().remove(key);
        }

        pub fn stored(&self, key: &ObjectKey) -> Option<K> {
            self.objects.lock().get(key).cloned()
        }

        pub fn all(&self) -> Vec<K> {
            self.objects.lock().values().cloned().collect()
        }

        /// Number of create/patch/update/delete calls that reached the store
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        /// Patch bodies received, in order
        pub fn patches(&self) -> Vec<serde_json::Value> {
            self.patches.lock().clone()
        }

        /// Fail the next call of `op` with `err`
        pub fn fail_next(&self, op: Op, err: Error) {
            self.failures.lock().push_back((op, err));
        }

        /// Run `hook` on every object after it is written, e.g. to simulate
        /// another controller updating status.
        pub fn on_write(&self, hook: impl Fn(&mut K) + Send + Sync + 'static) {
            *self.on_write.lock() = Some(Arc::new(hook));
        }

        fn take_failure(&self, op: Op) -> Option<Error> {
            let mut failures = self.failures.lock();
            let pos = failures.iter().position(|(o, _)| *o == op)?;
            failures.remove(pos).map(|(_, e)| e)
        }

        fn not_found(key: &ObjectKey) -> Error {
            Error::not_found(kind_of::<K>(), &key.namespace, &key.name)
        }

        fn store(&self, key: ObjectKey, mut obj: K) -> K {
            let version = self
                .objects
                .lock()
                .get(&key)
                .and_then(|o| o.meta().resource_version.clone())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            obj.meta_mut().resource_version = Some((version + 1).to_string());
            let hook = self.on_write.lock().clone();
            if let Some(hook) = hook {
                hook(&mut obj);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.objects.lock().insert(key, obj.clone());
            obj
        }
    }

    impl<K> ObjectCache<K> for FakeApi<K>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    {
        fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
            self.stored(key).map(Arc::new)
        }

        fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
            self.objects
                .lock()
                .iter()
                .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
                .map(|(_, obj)| Arc::new(obj.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl<K> ObjectApi<K> for FakeApi<K>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        async fn get(&self, key: &ObjectKey) -> Result<K, Error> {
            if let Some(err) = self.take_failure(Op::Get) {
                return Err(err);
            }
            self.stored(key).ok_or_else(|| Self::not_found(key))
        }

        async fn create(&self, obj: &K) -> Result<K, Error> {
            if let Some(err) = self.take_failure(Op::Create) {
                return Err(err);
            }
            let key = ObjectKey::of(obj);
            if self.objects.lock().contains_key(&key) {
                return Err(Error::transient(format!("{key} already exists")));
            }
            Ok(self.store(key, obj.clone()))
        }

        async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, Error> {
            if let Some(err) = self.take_failure(Op::Patch) {
                return Err(err);
            }
            let current = self.stored(key).ok_or_else(|| Self::not_found(key))?;
            if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
                if current.meta().resource_version.as_deref() != Some(expected) {
                    return Err(Error::transient(format!("conflict patching {key}")));
                }
            }
            let mut value = serde_json::to_value(&current)?;
            json_patch::merge(&mut value, patch);
            let patched: K = serde_json::from_value(value)?;
            self.patches.lock().push(patch.clone());
            Ok(self.store(key.clone(), patched))
        }

        async fn update(&self, obj: &K) -> Result<K, Error> {
            if let Some(err) = self.take_failure(Op::Update) {
                return Err(err);
            }
            let key = ObjectKey::of(obj);
            let current = self.stored(&key).ok_or_else(|| Self::not_found(&key))?;
            if obj.meta().resource_version.is_some()
                && obj.meta().resource_version != current.meta().resource_version
            {
                return Err(Error::transient(format!("conflict updating {key}")));
            }
            Ok(self.store(key, obj.clone()))
        }

        async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
            if let Some(err) = self.take_failure(Op::Delete) {
                return Err(err);
            }
            match self.objects.lock().remove(key) {
                Some(_) => {
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(Self::not_found(key)),
            }
        }

        async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
            if let Some(err) = self.take_failure(Op::List) {
                return Err(err);
            }
            let wanted: Vec<(&str, &str)> = label_selector
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .collect();
            Ok(self
                .objects
                .lock()
                .iter()
                .filter(|(key, _)| key.namespace == namespace)
                .filter(|(_, obj)| {
                    let labels = obj.labels();
                    wanted
                        .iter()
                        .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
                })
                .map(|(_, obj)| obj.clone())
                .collect())
        }
    }
}
