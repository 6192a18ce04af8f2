//! Patch Engine
//!
//! Fetch, transform, diff, apply. Every write goes through a minimal JSON
//! merge patch (RFC 7386) computed from the canonical serialization of the
//! object before and after the caller's transform. An empty diff means no
//! write at all, which is what makes reconciles idempotent.
//!
//! Merge patches replace lists such as `containers` wholesale, so a non-empty
//! body always carries the `resourceVersion` it was computed against. A write
//! based on a stale read is rejected with a conflict and retried against
//! fresh state instead of reverting the other writer's change.
//!
//! Transforms are plain `Fn(K) -> K` values. They may run several times
//! against different snapshots of the same object, so they must not have
//! side effects.

use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::api::{kind_of, ObjectApi, ObjectKey};
use crate::retry::{poll_immediate, Attempt, PollError, RetryPolicy};
use crate::Error;

/// What a write helper did to the object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// The transform produced no change; nothing was sent
    Unchanged,
    /// The object did not exist and was created
    Created,
    /// A merge patch was applied
    Patched,
}

/// Compute the JSON merge patch that turns `original` into `modified`.
///
/// Keys missing from `modified` become `null`; arrays and scalars are
/// replaced wholesale. Identical inputs yield `{}`.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    diff(original, modified).unwrap_or_else(|| Value::Object(Map::new()))
}

fn diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new) in modi {
                match orig.get(key) {
                    None => {
                        patch.insert(key.clone(), new.clone());
                    }
                    Some(old) if old == new => {}
                    Some(old @ Value::Object(_)) if new.is_object() => {
                        if let Some(child) = diff(old, new) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    Some(_) => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}

/// Whether a merge patch body would change nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    match patch {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Pin a non-empty patch body to the resourceVersion it was computed from
pub fn with_precondition(mut body: Value, resource_version: Option<&str>) -> Value {
    if let (Some(version), Value::Object(map)) = (resource_version, &mut body) {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".to_string(), Value::String(version.to_string()));
        }
    }
    body
}

/// Canonical serialization of an object: JSON with sorted keys
pub fn canonicalize<K: Serialize>(obj: &K) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(|e| Error::patch_computation(e.to_string()))
}

/// Apply `transform` to `current` and send the resulting merge patch.
///
/// Returns `current` untouched, with no request made, when the transform
/// changes nothing. Otherwise the body is pinned to `current`'s
/// resourceVersion, so a concurrent write in between fails with a conflict.
pub async fn patch<K, A, F>(api: &A, current: K, transform: F) -> Result<(K, Verb), Error>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    A: ObjectApi<K> + ?Sized,
    F: Fn(K) -> K,
{
    let key = ObjectKey::of(&current);
    let original = canonicalize(&current)?;
    let modified = canonicalize(&transform(current.clone()))?;

    let body = create_merge_patch(&original, &modified);
    if is_empty_patch(&body) {
        debug!(kind = %kind_of::<K>(), key = %key, "object already up to date");
        return Ok((current, Verb::Unchanged));
    }

    let body = with_precondition(body, current.meta().resource_version.as_deref());
    debug!(kind = %kind_of::<K>(), key = %key, patch = %body, "patching object");
    let patched = api.patch(&key, &body).await?;
    Ok((patched, Verb::Patched))
}

/// Patch the object at `key`, or create it from `transform(K::default())`
/// when it does not exist.
pub async fn create_or_patch<K, A, F>(api: &A, key: &ObjectKey, transform: F) -> Result<(K, Verb), Error>
where
    K: Resource<DynamicType = ()> + Default + Clone + Serialize + DeserializeOwned + Send + Sync,
    A: ObjectApi<K> + ?Sized,
    F: Fn(K) -> K,
{
    match api.get(key).await {
        Ok(current) => patch(api, current, transform).await,
        Err(e) if e.is_not_found() => {
            let mut empty = K::default();
            empty.meta_mut().name = Some(key.name.clone());
            empty.meta_mut().namespace = Some(key.namespace.clone());

            let mut desired = transform(empty);
            // The transform may not rename the object
            desired.meta_mut().name = Some(key.name.clone());
            desired.meta_mut().namespace = Some(key.namespace.clone());

            info!(kind = %kind_of::<K>(), key = %key, "creating object");
            let created = api.create(&desired).await?;
            Ok((created, Verb::Created))
        }
        Err(e) => Err(e),
    }
}

/// Fetch and patch `key`, retrying failures at `policy.interval` until
/// `policy.timeout`.
///
/// Errors that [`Error::is_retryable`] calls terminal (NotFound, patch
/// computation failures, validation) abort at once.
pub async fn try_patch<K, A, F>(
    api: &A,
    key: &ObjectKey,
    policy: &RetryPolicy,
    transform: F,
) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    A: ObjectApi<K> + ?Sized,
    F: Fn(K) -> K + Sync,
{
    let kind = kind_of::<K>();
    let kind_ref = kind.as_str();
    let transform = &transform;

    let result = poll_immediate(policy, move |attempt| async move {
        let current = match api.get(key).await {
            Ok(obj) => obj,
            Err(e) if !e.is_retryable() => return Attempt::Abort(e),
            Err(e) => {
                warn!(attempt, kind = %kind_ref, key = %key, error = %e, "failed to fetch object, retrying");
                return Attempt::Failed(e);
            }
        };
        match patch(api, current, transform).await {
            Ok((obj, _)) => Attempt::Ready(obj),
            Err(e) if !e.is_retryable() => Attempt::Abort(e),
            Err(e) => {
                warn!(attempt, kind = %kind_ref, key = %key, error = %e, "failed to patch object, retrying");
                Attempt::Failed(e)
            }
        }
    })
    .await;

    result.map_err(|e| exhausted("patch", kind, key, e))
}

/// Like [`try_patch`] but replaces the whole object, relying on
/// resourceVersion for optimistic concurrency. Conflicts are retried.
pub async fn try_update<K, A, F>(
    api: &A,
    key: &ObjectKey,
    policy: &RetryPolicy,
    transform: F,
) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    A: ObjectApi<K> + ?Sized,
    F: Fn(K) -> K + Sync,
{
    let kind = kind_of::<K>();
    let kind_ref = kind.as_str();
    let transform = &transform;

    let result = poll_immediate(policy, move |attempt| async move {
        let current = match api.get(key).await {
            Ok(obj) => obj,
            Err(e) if !e.is_retryable() => return Attempt::Abort(e),
            Err(e) => {
                warn!(attempt, kind = %kind_ref, key = %key, error = %e, "failed to fetch object, retrying");
                return Attempt::Failed(e);
            }
        };
        let modified = transform(current.clone());
        match (canonicalize(&current), canonicalize(&modified)) {
            (Ok(before), Ok(after)) if before == after => return Attempt::Ready(current),
            (Err(e), _) | (_, Err(e)) => return Attempt::Abort(e),
            _ => {}
        }
        match api.update(&modified).await {
            Ok(obj) => Attempt::Ready(obj),
            Err(e) if !e.is_retryable() => Attempt::Abort(e),
            Err(e) => {
                warn!(attempt, kind = %kind_ref, key = %key, error = %e, "failed to update object, retrying");
                Attempt::Failed(e)
            }
        }
    })
    .await;

    result.map_err(|e| exhausted("update", kind, key, e))
}

/// Delete `key`, treating NotFound as success. Returns whether anything was
/// deleted.
pub async fn delete_if_exists<K, A>(api: &A, key: &ObjectKey) -> Result<bool, Error>
where
    K: Resource<DynamicType = ()>,
    A: ObjectApi<K> + ?Sized,
{
    match api.delete(key).await {
        Ok(()) => {
            info!(kind = %kind_of::<K>(), key = %key, "deleted object");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

fn exhausted(operation: &'static str, kind: String, key: &ObjectKey, err: PollError) -> Error {
    match err {
        PollError::Aborted { error, .. } => error,
        PollError::TimedOut {
            attempts,
            last_error,
        } => Error::RetryExhausted {
            operation,
            kind,
            key: key.to_string(),
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| Error::transient("no attempt completed")),
            ),
        },
    }
}
