//! Role bindings for sidecar service accounts
//!
//! When RBAC management is enabled, each injected workload gets a
//! RoleBinding in its namespace granting the sidecar ClusterRole to the pod
//! template's service account. The binding is owned by the workload, so
//! deleting the workload garbage-collects it.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::{Resource, ResourceExt};
use tracing::info;

use crate::api::{ObjectApi, ObjectKey};
use crate::patch::{create_or_patch, delete_if_exists, Verb};
use crate::workload::Workload;
use crate::Error;

/// Label marking objects this operator manages
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "backup-sidecar-operator";

/// Name of the RoleBinding for a workload.
///
/// Includes the kind so a Deployment and a StatefulSet with the same name
/// do not share a binding.
pub fn role_binding_name<W: Workload>(workload: &W) -> String {
    format!(
        "stash-{}-{}",
        W::kind(&()).to_lowercase(),
        workload.name_any()
    )
}

/// Transform that shapes a RoleBinding for `workload`
fn desired_binding<W: Workload>(
    workload: &W,
    cluster_role: &str,
) -> Result<impl Fn(RoleBinding) -> RoleBinding + Sync, Error> {
    let owner = workload.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation(format!(
            "{} {} has no uid to own a role binding",
            W::kind(&()),
            workload.name_any()
        ))
    })?;
    let namespace = workload.namespace().unwrap_or_default();
    let service_account = workload.service_account();
    let cluster_role = cluster_role.to_string();

    Ok(move |mut binding: RoleBinding| {
        binding.labels_mut().extend(managed_labels());
        binding.meta_mut().owner_references = Some(vec![owner.clone()]);
        binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.clone(),
        };
        binding.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.clone(),
            namespace: Some(namespace.clone()),
            ..Default::default()
        }]);
        binding
    })
}

/// Create or update the RoleBinding for `workload`
pub async fn ensure_role_binding<W, A>(api: &A, workload: &W, cluster_role: &str) -> Result<Verb, Error>
where
    W: Workload,
    A: ObjectApi<RoleBinding> + ?Sized,
{
    let key = ObjectKey::new(
        workload.namespace().unwrap_or_default(),
        role_binding_name(workload),
    );
    let transform = desired_binding(workload, cluster_role)?;
    let (_, verb) = create_or_patch(api, &key, transform).await?;
    if verb != Verb::Unchanged {
        info!(
            role_binding = %key,
            service_account = %workload.service_account(),
            ?verb,
            "reconciled sidecar role binding"
        );
    }
    Ok(verb)
}

/// Delete the RoleBinding for `workload`; a missing binding is success
pub async fn ensure_role_binding_deleted<W, A>(api: &A, workload: &W) -> Result<(), Error>
where
    W: Workload,
    A: ObjectApi<RoleBinding> + ?Sized,
{
    let key = ObjectKey::new(
        workload.namespace().unwrap_or_default(),
        role_binding_name(workload),
    );
    delete_if_exists(api, &key).await.map(|_| ())
}

/// Labels on bindings this operator created
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}
