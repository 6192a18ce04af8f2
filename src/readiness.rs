//! Readiness confirmation after a template change
//!
//! A committed patch only changes the stored object. These waits confirm the
//! change took effect: first that the workload rolled out its new template,
//! then that its pods actually run (or no longer run) the sidecar.

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::api::{kind_of, ObjectApi, ObjectKey};
use crate::retry::{poll_immediate, Attempt, PollError, RetryPolicy};
use crate::selector::to_selector_string;
use crate::sidecar::SIDECAR_CONTAINER_NAME;
use crate::workload::Workload;
use crate::Error;

/// Poll the workload until its latest pod template is fully rolled out
pub async fn wait_until_rollout_ready<W, A>(api: &A, key: &ObjectKey, policy: &RetryPolicy) -> Result<W, Error>
where
    W: Workload,
    A: ObjectApi<W> + ?Sized,
{
    let result = poll_immediate(policy, move |attempt| async move {
        match api.get(key).await {
            Ok(obj) if obj.rollout_complete() => Attempt::Ready(obj),
            Ok(_) => {
                debug!(attempt, kind = %kind_of::<W>(), workload = %key, "rollout in progress");
                Attempt::Pending
            }
            Err(e) if e.is_not_found() => Attempt::Abort(e),
            Err(e) => Attempt::Failed(e),
        }
    })
    .await;

    result.map_err(|e| timeout_error(e, format!("rollout of {} {key}", kind_of::<W>())))
}

/// Poll the workload's pods until at least one runs the sidecar.
///
/// Skipped for workloads scaled to zero.
pub async fn wait_until_sidecar_added<W, P>(pods: &P, workload: &W, policy: &RetryPolicy) -> Result<(), Error>
where
    W: Workload,
    P: ObjectApi<Pod> + ?Sized,
{
    wait_for_pods(pods, workload, policy, "sidecar to start", |pods| {
        pods.iter().any(sidecar_running)
    })
    .await
}

/// Poll the workload's pods until none still carries the sidecar.
///
/// Skipped for workloads scaled to zero.
pub async fn wait_until_sidecar_removed<W, P>(pods: &P, workload: &W, policy: &RetryPolicy) -> Result<(), Error>
where
    W: Workload,
    P: ObjectApi<Pod> + ?Sized,
{
    wait_for_pods(pods, workload, policy, "sidecar to be removed", |pods| {
        !pods.iter().any(has_sidecar_container)
    })
    .await
}

async fn wait_for_pods<W, P, F>(
    pods: &P,
    workload: &W,
    policy: &RetryPolicy,
    what: &str,
    done: F,
) -> Result<(), Error>
where
    W: Workload,
    P: ObjectApi<Pod> + ?Sized,
    F: Fn(&[Pod]) -> bool + Sync,
{
    let key = ObjectKey::of(workload);
    if workload.desired_replicas() == 0 {
        debug!(kind = %kind_of::<W>(), workload = %key, "no replicas, skipping pod wait");
        return Ok(());
    }

    let selector = workload
        .selector()
        .map(to_selector_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation(format!("{} {key} has no pod selector", kind_of::<W>())))?;

    let namespace = key.namespace.as_str();
    let selector = selector.as_str();
    let done = &done;
    let result = poll_immediate(policy, move |attempt| async move {
        match pods.list(namespace, selector).await {
            Ok(list) => {
                let live: Vec<Pod> = list
                    .into_iter()
                    .filter(|p| p.metadata.deletion_timestamp.is_none())
                    .collect();
                if done(live.as_slice()) {
                    Attempt::Ready(())
                } else {
                    debug!(attempt, pods = live.len(), selector, "waiting on pods");
                    Attempt::Pending
                }
            }
            Err(e) => Attempt::Failed(e),
        }
    })
    .await;

    result.map_err(|e| timeout_error(e, format!("{what} in {} {key}", kind_of::<W>())))
}

fn has_sidecar_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .is_some_and(|s| s.containers.iter().any(|c| c.name == SIDECAR_CONTAINER_NAME))
}

fn sidecar_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|cs| {
                cs.name == SIDECAR_CONTAINER_NAME
                    && cs.state.as_ref().is_some_and(|st| st.running.is_some())
            })
        })
}

fn timeout_error(err: PollError, what: String) -> Error {
    match err {
        PollError::Aborted { error, .. } => error,
        PollError::TimedOut {
            last_error: Some(error),
            attempts,
        } => Error::readiness_timeout(format!("{what} after {attempts} attempts: {error}")),
        PollError::TimedOut { .. } => Error::readiness_timeout(what),
    }
}
