//! Typed access to the workload kinds the controller mutates
//!
//! Every kind owns a pod template. The [`Workload`] trait exposes the pieces
//! the decision logic, the sidecar transforms and the readiness waits need,
//! so all of them are written once and instantiated per kind:
//! - Deployment
//! - ReplicaSet (skipped when owned by a Deployment)
//! - StatefulSet
//! - DaemonSet

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Service account used when a pod template does not name one
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// A namespaced object owning a pod template
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The pod template, if the object has a spec
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    /// The pod template, created empty if missing
    fn pod_template_mut(&mut self) -> &mut PodTemplateSpec;

    /// Selector the workload uses to find its pods
    fn selector(&self) -> Option<&LabelSelector>;

    /// Replicas the workload is asked to run
    fn desired_replicas(&self) -> i32;

    /// Whether the latest generation of the pod template is fully rolled out
    fn rollout_complete(&self) -> bool;

    /// Whether another controller owns this object's pod template
    fn managed_elsewhere(&self) -> bool {
        false
    }

    /// Pod spec inside the template
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.pod_template().and_then(|t| t.spec.as_ref())
    }

    /// Pod spec inside the template, created empty if missing
    fn pod_spec_mut(&mut self) -> &mut PodSpec {
        self.pod_template_mut()
            .spec
            .get_or_insert_with(Default::default)
    }

    /// Labels pods of this workload carry; Backups select on these
    fn pod_labels(&self) -> BTreeMap<String, String> {
        self.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }

    /// Service account pods run as
    fn service_account(&self) -> String {
        self.pod_spec()
            .and_then(|s| s.service_account_name.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string())
    }
}

/// Whether the controller has seen the object's latest generation
fn generation_observed<K: Resource>(obj: &K, observed: Option<i64>) -> bool {
    observed.unwrap_or(0) >= obj.meta().generation.unwrap_or(0)
}

// =============================================================================
// Deployment
// =============================================================================

impl Workload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn desired_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let desired = self.desired_replicas();
        generation_observed(self, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) == desired
            && status.available_replicas.unwrap_or(0) == desired
            && status.replicas.unwrap_or(0) == desired
    }
}

// =============================================================================
// ReplicaSet
// =============================================================================

impl Workload for ReplicaSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().and_then(|s| s.template.as_ref())
    }

    fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .get_or_insert_with(Default::default)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn desired_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let desired = self.desired_replicas();
        generation_observed(self, status.observed_generation)
            && status.ready_replicas.unwrap_or(0) == desired
            && status.fully_labeled_replicas.unwrap_or(0) == desired
    }

    fn managed_elsewhere(&self) -> bool {
        self.owner_references()
            .iter()
            .any(|owner| owner.kind == "Deployment")
    }
}

// =============================================================================
// StatefulSet
// =============================================================================

impl Workload for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn desired_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let desired = self.desired_replicas();
        generation_observed(self, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) == desired
            && status.ready_replicas.unwrap_or(0) == desired
            && status.current_revision == status.update_revision
    }
}

// =============================================================================
// DaemonSet
// =============================================================================

impl Workload for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    /// One pod per scheduled node; the status is the only source
    fn desired_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.desired_number_scheduled)
            .unwrap_or(0)
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        generation_observed(self, status.observed_generation)
            && status.updated_number_scheduled.unwrap_or(0) == status.desired_number_scheduled
            && status.number_ready == status.desired_number_scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentSpec, DeploymentStatus, ReplicaSetSpec, ReplicaSetStatus,
        StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn meta(generation: i64) -> ObjectMeta {
        ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            generation: Some(generation),
            ..Default::default()
        }
    }

    fn deployment(replicas: i32, status: DeploymentStatus) -> Deployment {
        Deployment {
            metadata: meta(2),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(status),
        }
    }

    #[test]
    fn deployment_rollout_requires_observed_generation() {
        let status = DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(3),
            updated_replicas: Some(3),
            available_replicas: Some(3),
            ..Default::default()
        };
        assert!(!deployment(3, status.clone()).rollout_complete());

        let caught_up = DeploymentStatus {
            observed_generation: Some(2),
            ..status
        };
        assert!(deployment(3, caught_up).rollout_complete());
    }

    #[test]
    fn deployment_rollout_waits_for_old_replicas_to_go() {
        let status = DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(4),
            updated_replicas: Some(3),
            available_replicas: Some(3),
            ..Default::default()
        };
        assert!(!deployment(3, status).rollout_complete());
    }

    #[test]
    fn deployment_without_status_is_not_rolled_out() {
        let mut deploy = deployment(1, DeploymentStatus::default());
        deploy.status = None;
        assert!(!deploy.rollout_complete());
    }

    #[test]
    fn zero_replica_deployment_rolls_out_immediately() {
        let status = DeploymentStatus {
            observed_generation: Some(2),
            ..Default::default()
        };
        assert!(deployment(0, status).rollout_complete());
    }

    #[test]
    fn replica_set_owned_by_deployment_is_managed_elsewhere() {
        let mut rs = ReplicaSet {
            metadata: meta(1),
            spec: Some(ReplicaSetSpec::default()),
            status: None,
        };
        assert!(!rs.managed_elsewhere());

        rs.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            uid: "1234".to_string(),
            ..Default::default()
        }]);
        assert!(rs.managed_elsewhere());
    }

    #[test]
    fn replica_set_rollout_counts_labeled_ready_pods() {
        let rs = ReplicaSet {
            metadata: meta(1),
            spec: Some(ReplicaSetSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(ReplicaSetStatus {
                observed_generation: Some(1),
                replicas: 2,
                ready_replicas: Some(2),
                fully_labeled_replicas: Some(1),
                ..Default::default()
            }),
        };
        assert!(!rs.rollout_complete());
    }

    #[test]
    fn stateful_set_rollout_requires_matching_revisions() {
        let mut sts = StatefulSet {
            metadata: meta(1),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(1),
                replicas: 1,
                ready_replicas: Some(1),
                updated_replicas: Some(1),
                current_revision: Some("web-1".to_string()),
                update_revision: Some("web-2".to_string()),
                ..Default::default()
            }),
        };
        assert!(!sts.rollout_complete());

        if let Some(status) = sts.status.as_mut() {
            status.current_revision = Some("web-2".to_string());
        }
        assert!(sts.rollout_complete());
    }

    #[test]
    fn daemon_set_desired_replicas_come_from_status() {
        let ds = DaemonSet {
            metadata: meta(1),
            spec: None,
            status: Some(DaemonSetStatus {
                observed_generation: Some(1),
                desired_number_scheduled: 3,
                number_ready: 3,
                updated_number_scheduled: Some(3),
                ..Default::default()
            }),
        };
        assert_eq!(ds.desired_replicas(), 3);
        assert!(ds.rollout_complete());
    }

    #[test]
    fn pod_spec_mut_creates_missing_template() {
        let mut deploy = Deployment::default();
        assert!(deploy.pod_spec().is_none());
        deploy.pod_spec_mut().service_account_name = Some("backup".to_string());
        assert_eq!(deploy.service_account(), "backup");
    }

    #[test]
    fn service_account_defaults_when_unset_or_empty() {
        let mut deploy = Deployment::default();
        assert_eq!(deploy.service_account(), DEFAULT_SERVICE_ACCOUNT);
        deploy.pod_spec_mut().service_account_name = Some(String::new());
        assert_eq!(deploy.service_account(), DEFAULT_SERVICE_ACCOUNT);
    }
}
