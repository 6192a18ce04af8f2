//! Sidecar injection decision logic
//!
//! Each reconcile compares the Backup recorded on the workload (the
//! last-applied annotation) with the Backup that currently selects it, and
//! either does nothing, injects the sidecar or removes it. Every step works
//! from fresh cluster state, so a reconcile interrupted at any point is
//! finished by the next one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::ResourceExt;
use tracing::{debug, info};

use super::Reconcile;
use crate::api::{kind_of, ObjectApi, ObjectKey};
use crate::cache::ObjectCache;
use crate::config::ControllerConfig;
use crate::crd::Backup;
use crate::patch::try_patch;
use crate::rbac::{ensure_role_binding, ensure_role_binding_deleted};
use crate::readiness::{wait_until_rollout_ready, wait_until_sidecar_added, wait_until_sidecar_removed};
use crate::selector;
use crate::sidecar::{self, get_applied_backup, Sidecar};
use crate::workload::Workload;
use crate::Error;

/// What a reconcile must do to a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SidecarAction {
    /// Already converged
    None,
    /// Add the sidecar, or rewrite it for a changed Backup
    Inject,
    /// Strip the sidecar
    Remove,
}

/// Pick the action from the applied and the matched Backup.
///
/// Backups compare by spec only. The recorded image tag is not an input.
pub fn decide(applied: Option<&Backup>, matched: Option<&Backup>) -> SidecarAction {
    match (applied, matched) {
        (None, None) => SidecarAction::None,
        (None, Some(_)) => SidecarAction::Inject,
        (Some(_), None) => SidecarAction::Remove,
        (Some(old), Some(new)) if old.spec == new.spec => SidecarAction::None,
        (Some(_), Some(_)) => SidecarAction::Inject,
    }
}

/// The single Backup among `backups` selecting `labels`.
///
/// More than one match is an error rather than an arbitrary pick.
pub fn find_matching_backup(
    workload: &ObjectKey,
    backups: &[Arc<Backup>],
    labels: &BTreeMap<String, String>,
) -> Result<Option<Arc<Backup>>, Error> {
    let mut matches: Vec<&Arc<Backup>> = backups
        .iter()
        .filter(|b| b.namespace().as_deref() == Some(workload.namespace.as_str()))
        .filter(|b| selector::matches(&b.spec.selector, labels))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop().cloned()),
        _ => {
            let mut names: Vec<String> = matches.iter().map(|b| b.name_any()).collect();
            names.sort();
            Err(Error::AmbiguousMatch {
                workload: workload.to_string(),
                backups: names,
            })
        }
    }
}

/// Cluster access the injector needs
pub struct Apis<W> {
    /// The workload kind being reconciled
    pub workloads: Arc<dyn ObjectApi<W>>,
    /// Pods, for the sidecar waits
    pub pods: Arc<dyn ObjectApi<Pod>>,
    /// Repository secrets
    pub secrets: Arc<dyn ObjectApi<Secret>>,
    /// Sidecar role bindings
    pub role_bindings: Arc<dyn ObjectApi<RoleBinding>>,
}

/// Reconciles the sidecar of one workload kind
pub struct Injector<W> {
    config: Arc<ControllerConfig>,
    apis: Apis<W>,
    backups: Arc<dyn ObjectCache<Backup>>,
}

impl<W: Workload> Injector<W> {
    /// Create an injector reading Backups from `backups`
    pub fn new(config: Arc<ControllerConfig>, apis: Apis<W>, backups: Arc<dyn ObjectCache<Backup>>) -> Self {
        Self {
            config,
            apis,
            backups,
        }
    }

    async fn inject(&self, workload: &W, key: &ObjectKey, backup: &Backup, old: Option<&Backup>) -> Result<(), Error> {
        let secret_name = &backup.spec.backend.storage_secret_name;
        if secret_name.is_empty() {
            return Err(Error::validation(format!(
                "Backup {}/{} has no repository secret name",
                key.namespace,
                backup.name_any()
            )));
        }
        self.apis
            .secrets
            .get(&ObjectKey::new(&key.namespace, secret_name))
            .await?;

        if self.config.enable_rbac {
            ensure_role_binding(
                self.apis.role_bindings.as_ref(),
                workload,
                &self.config.sidecar_cluster_role,
            )
            .await?;
        }

        let sidecar = Sidecar::new(backup, workload, &self.config)?;
        try_patch(
            self.apis.workloads.as_ref(),
            key,
            &self.config.retry_policy(),
            |w| sidecar.inject(w, old),
        )
        .await?;
        info!(
            kind = %kind_of::<W>(),
            workload = %key,
            backup = %backup.name_any(),
            tag = %self.config.sidecar_image_tag,
            "injected backup sidecar"
        );

        let readiness = self.config.readiness_policy();
        let rolled_out: W =
            wait_until_rollout_ready(self.apis.workloads.as_ref(), key, &readiness).await?;
        wait_until_sidecar_added(self.apis.pods.as_ref(), &rolled_out, &readiness).await?;
        debug!(kind = %kind_of::<W>(), workload = %key, "sidecar running");
        Ok(())
    }

    async fn remove(&self, workload: &W, key: &ObjectKey, old: Option<&Backup>) -> Result<(), Error> {
        if self.config.enable_rbac {
            ensure_role_binding_deleted(self.apis.role_bindings.as_ref(), workload).await?;
        }

        try_patch(
            self.apis.workloads.as_ref(),
            key,
            &self.config.retry_policy(),
            |w| sidecar::remove(w, old),
        )
        .await?;
        info!(kind = %kind_of::<W>(), workload = %key, "removed backup sidecar");

        let readiness = self.config.readiness_policy();
        let rolled_out: W =
            wait_until_rollout_ready(self.apis.workloads.as_ref(), key, &readiness).await?;
        wait_until_sidecar_removed(self.apis.pods.as_ref(), &rolled_out, &readiness).await
    }
}

#[async_trait]
impl<W: Workload> Reconcile<W> for Injector<W> {
    async fn reconcile(&self, workload: Arc<W>) -> Result<(), Error> {
        let key = ObjectKey::of(workload.as_ref());
        if workload.managed_elsewhere() {
            debug!(kind = %kind_of::<W>(), workload = %key, "pod template owned by another workload, skipping");
            return Ok(());
        }

        let applied = get_applied_backup(workload.as_ref());
        let backups = self.backups.list(Some(key.namespace.as_str()));
        let matched = find_matching_backup(&key, &backups, &workload.pod_labels())?;

        match decide(applied.as_ref(), matched.as_deref()) {
            SidecarAction::None => {
                debug!(kind = %kind_of::<W>(), workload = %key, "sidecar up to date");
                Ok(())
            }
            SidecarAction::Inject => {
                let backup = matched.ok_or_else(|| Error::validation("inject without a matching Backup"))?;
                self.inject(workload.as_ref(), &key, &backup, applied.as_ref())
                    .await
            }
            SidecarAction::Remove => self.remove(workload.as_ref(), &key, applied.as_ref()).await,
        }
    }
}
