//! Sidecar container, volumes and annotations
//!
//! Everything here is pure: it builds the sidecar pieces for a Backup and
//! applies or strips them on a workload value. The controller hands these
//! transforms to the Patch Engine.

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::warn;

use crate::config::ControllerConfig;
use crate::crd::Backup;
use crate::workload::Workload;
use crate::Error;

/// Reserved name of the injected container
pub const SIDECAR_CONTAINER_NAME: &str = "stash";

/// Scratch space volume
pub const SCRATCH_VOLUME_NAME: &str = "stash-scratchdir";
/// Downward API volume exposing pod labels
pub const PODINFO_VOLUME_NAME: &str = "stash-podinfo";
/// Volume of a local backend
pub const LOCAL_VOLUME_NAME: &str = "local-backend";

/// Where the scratch volume is mounted
pub const SCRATCH_DIR: &str = "/tmp";
/// Where the podinfo volume is mounted
pub const PODINFO_DIR: &str = "/etc/stash";

/// Annotation holding the canonical JSON of the Backup in force
pub const LAST_APPLIED_CONFIGURATION: &str = "stash.backup.dev/last-applied-configuration";
/// Annotation holding the sidecar image tag in force
pub const VERSION_TAG: &str = "stash.backup.dev/version-tag";

// =============================================================================
// Applied configuration
// =============================================================================

/// Strip a Backup down to what is recorded on workloads: type, identity, spec
pub fn applied_snapshot(backup: &Backup) -> Backup {
    let mut snapshot = Backup::new(&backup.name_any(), backup.spec.clone());
    snapshot.metadata = ObjectMeta {
        name: backup.metadata.name.clone(),
        namespace: backup.metadata.namespace.clone(),
        ..Default::default()
    };
    snapshot
}

/// Canonical JSON of a Backup's applied snapshot (sorted keys)
pub fn canonical_json(backup: &Backup) -> Result<String, Error> {
    let value = serde_json::to_value(applied_snapshot(backup))?;
    Ok(value.to_string())
}

/// The Backup recorded on a workload, if any.
///
/// An unparsable annotation counts as absent, which forces re-injection.
pub fn get_applied_backup<K: Resource>(obj: &K) -> Option<Backup> {
    let raw = obj.annotations().get(LAST_APPLIED_CONFIGURATION)?;
    match serde_json::from_str(raw) {
        Ok(backup) => Some(backup),
        Err(e) => {
            warn!(
                object = %obj.name_any(),
                error = %e,
                "ignoring unparsable last-applied-configuration annotation"
            );
            None
        }
    }
}

// =============================================================================
// Containers and volumes
// =============================================================================

/// Replace the container with the same name, or append it
pub fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

/// Remove every container with `name`
pub fn ensure_container_deleted(containers: &mut Vec<Container>, name: &str) {
    containers.retain(|c| c.name != name);
}

/// Replace the volume with the same name, or append it
pub fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Remove every volume with `name`
pub fn ensure_volume_deleted(volumes: &mut Vec<Volume>, name: &str) {
    volumes.retain(|v| v.name != name);
}

/// Empty-dir scratch space for the sidecar
pub fn scratch_volume() -> Volume {
    Volume {
        name: SCRATCH_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Downward API volume exposing the pod's labels as `labels`
pub fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME_NAME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(field_selector("metadata.labels")),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Add, replace or drop the local backend volume.
///
/// `new_local` is the volume the incoming Backup needs. Without one, the
/// volume is only dropped if the previously applied Backup had a local
/// backend; an unrelated volume that happens to share the name is left alone
/// otherwise.
pub fn merge_local_volume(volumes: &mut Vec<Volume>, old: Option<&Backup>, new_local: Option<Volume>) {
    match new_local {
        Some(volume) => upsert_volume(volumes, volume),
        None if old.is_some_and(has_local_backend) => {
            ensure_volume_deleted(volumes, LOCAL_VOLUME_NAME)
        }
        None => {}
    }
}

fn has_local_backend(backup: &Backup) -> bool {
    backup.spec.backend.local.is_some()
}

fn field_selector(path: &str) -> ObjectFieldSelector {
    ObjectFieldSelector {
        field_path: path.to_string(),
        ..Default::default()
    }
}

fn env_from_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(field_selector(path)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Inject / remove
// =============================================================================

/// Everything needed to inject the sidecar for one Backup into one workload.
///
/// Built once per reconcile (the fallible part), then applied by
/// [`Sidecar::inject`] as many times as the Patch Engine needs.
#[derive(Clone, Debug)]
pub struct Sidecar {
    container: Container,
    local_volume: Option<Volume>,
    applied: String,
    version_tag: String,
}

impl Sidecar {
    /// Build the sidecar for `backup` running next to `workload`
    pub fn new<W: Workload>(backup: &Backup, workload: &W, config: &ControllerConfig) -> Result<Self, Error> {
        let local_volume = backup
            .spec
            .backend
            .local
            .as_ref()
            .map(|local| local.volume(LOCAL_VOLUME_NAME))
            .transpose()?;

        let mut mounts = vec![
            VolumeMount {
                name: SCRATCH_VOLUME_NAME.to_string(),
                mount_path: SCRATCH_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: PODINFO_VOLUME_NAME.to_string(),
                mount_path: PODINFO_DIR.to_string(),
                ..Default::default()
            },
        ];
        mounts.extend(backup.spec.volume_mounts.iter().cloned());
        if let Some(local) = &backup.spec.backend.local {
            mounts.push(VolumeMount {
                name: LOCAL_VOLUME_NAME.to_string(),
                mount_path: local.mount_path.clone(),
                ..Default::default()
            });
        }

        let container = Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(config.sidecar_image_ref()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "schedule".to_string(),
                format!("--backup-namespace={}", backup.namespace().unwrap_or_default()),
                format!("--backup-name={}", backup.name_any()),
                format!("--workload-kind={}", W::kind(&())),
                format!("--workload-name={}", workload.name_any()),
                format!("--scratch-dir={SCRATCH_DIR}"),
                format!("--pod-labels-path={PODINFO_DIR}/labels"),
            ]),
            env: Some(vec![
                env_from_field("NODE_NAME", "spec.nodeName"),
                env_from_field("POD_NAME", "metadata.name"),
            ]),
            volume_mounts: Some(mounts),
            resources: backup.spec.resources.clone(),
            ..Default::default()
        };

        Ok(Self {
            container,
            local_volume,
            applied: canonical_json(backup)?,
            version_tag: config.sidecar_image_tag.clone(),
        })
    }

    /// Upsert the container and volumes, and record the applied Backup.
    ///
    /// `old` is the previously applied Backup, used to drop a local volume the
    /// new Backup no longer needs.
    pub fn inject<W: Workload>(&self, mut workload: W, old: Option<&Backup>) -> W {
        let pod = workload.pod_spec_mut();
        upsert_container(&mut pod.containers, self.container.clone());

        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        upsert_volume(volumes, scratch_volume());
        upsert_volume(volumes, podinfo_volume());
        merge_local_volume(volumes, old, self.local_volume.clone());

        let annotations = workload.annotations_mut();
        annotations.insert(LAST_APPLIED_CONFIGURATION.to_string(), self.applied.clone());
        annotations.insert(VERSION_TAG.to_string(), self.version_tag.clone());
        workload
    }
}

/// Strip the sidecar, its volumes and both annotations.
///
/// The local backend volume goes only if `old` (the applied Backup) had one.
pub fn remove<W: Workload>(mut workload: W, old: Option<&Backup>) -> W {
    let pod = workload.pod_spec_mut();
    ensure_container_deleted(&mut pod.containers, SIDECAR_CONTAINER_NAME);

    if let Some(volumes) = pod.volumes.as_mut() {
        ensure_volume_deleted(volumes, SCRATCH_VOLUME_NAME);
        ensure_volume_deleted(volumes, PODINFO_VOLUME_NAME);
        merge_local_volume(volumes, old, None);
        if volumes.is_empty() {
            pod.volumes = None;
        }
    }

    let annotations = workload.annotations_mut();
    annotations.remove(LAST_APPLIED_CONFIGURATION);
    annotations.remove(VERSION_TAG);
    if annotations.is_empty() {
        workload.meta_mut().annotations = None;
    }
    workload
}

#[cfg(test)]
impl Sidecar {
    pub(crate) fn container(&self) -> &Container {
        &self.container
    }
}

/// Whether a workload's template carries the sidecar container
#[cfg(test)]
pub(crate) fn has_sidecar<W: Workload>(workload: &W) -> bool {
    workload
        .pod_spec()
        .is_some_and(|pod| pod.containers.iter().any(|c| c.name == SIDECAR_CONTAINER_NAME))
}

/// The sidecar's own annotations on `obj`
#[cfg(test)]
pub(crate) fn sidecar_annotations<K: Resource>(obj: &K) -> std::collections::BTreeMap<String, String> {
    obj.annotations()
        .iter()
        .filter(|(k, _)| k.as_str() == LAST_APPLIED_CONFIGURATION || k.as_str() == VERSION_TAG)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
