//! Backup Custom Resource Definition
//!
//! A Backup selects workloads in its namespace by pod labels and describes
//! where their data goes. Every selected workload gets a backup sidecar.

use k8s_openapi::api::core::v1::{ResourceRequirements, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Local filesystem backend (requires an extra volume in the pod)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackend {
    /// Where the repository is mounted inside the sidecar
    pub mount_path: String,

    /// Volume source holding the repository, in pod volume syntax
    /// (`hostPath`, `persistentVolumeClaim`, `nfs`, ...)
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub volume_source: Value,
}

impl LocalBackend {
    /// Build the pod volume for this backend under `name`
    pub fn volume(&self, name: &str) -> Result<Volume, Error> {
        let Value::Object(source) = &self.volume_source else {
            return Err(Error::validation(
                "local backend volumeSource must be an object",
            ));
        };
        let mut fields = source.clone();
        fields.insert("name".to_string(), Value::String(name.to_string()));
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::validation(format!("invalid local backend volumeSource: {e}")))
    }
}

/// S3 repository location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Backend {
    /// S3 endpoint
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// GCS repository location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsBackend {
    /// Bucket name
    pub bucket: String,
    /// Key prefix inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Azure repository location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureBackend {
    /// Blob container name
    pub container: String,
    /// Key prefix inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Repository backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Secret in the workload namespace holding repository credentials
    #[serde(default)]
    pub storage_secret_name: String,

    /// Local filesystem backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBackend>,

    /// S3 backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Backend>,

    /// GCS backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsBackend>,

    /// Azure backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureBackend>,
}

/// A group of paths snapshotted together
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    /// Directory to back up
    pub path: String,

    /// Tags attached to each snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Snapshot retention policy name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy_name: Option<String>,
}

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stash.backup.dev",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    shortname = "bk",
    namespaced,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.backend.storageSecretName"}"#,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Selects workloads by their pod template labels
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub selector: LabelSelector,

    /// Where backups are stored
    pub backend: Backend,

    /// Paths to back up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_groups: Vec<FileGroup>,

    /// Cron schedule for the sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Workload volumes to mount into the sidecar
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::crd::preserve_unknown_list")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Compute resources for the sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub resources: Option<ResourceRequirements>,
}
