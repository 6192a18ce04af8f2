//! Custom Resource Definitions for the backup sidecar operator

mod backup;

pub use backup::{
    AzureBackend, Backend, Backup, BackupSpec, FileGroup, GcsBackend, LocalBackend, S3Backend,
};

use schemars::gen::SchemaGenerator;
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject};

/// Schema for embedded core Kubernetes types: an object the API server
/// stores verbatim.
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), true.into());
    Schema::Object(schema)
}

/// Schema for a list of embedded core Kubernetes objects
pub(crate) fn preserve_unknown_list(gen: &mut SchemaGenerator) -> Schema {
    let schema = SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(preserve_unknown_fields(gen).into()),
            ..Default::default()
        })),
        ..Default::default()
    };
    Schema::Object(schema)
}
