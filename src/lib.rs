//! Backup sidecar operator
//!
//! Watches Deployments, ReplicaSets, StatefulSets and DaemonSets together with
//! `Backup` custom resources, and keeps a backup sidecar container (plus its
//! volumes, annotations and optional RoleBinding) in each workload's pod
//! template for exactly as long as a Backup selects it.
//!
//! # Modules
//!
//! - [`crd`] - The `Backup` custom resource
//! - [`workload`] - Uniform access to the pod templates of workload kinds
//! - [`sidecar`] - Sidecar container, volumes and annotation bookkeeping
//! - [`patch`] - Merge patch computation and retried writes
//! - [`rbac`] - RoleBindings for sidecar service accounts
//! - [`readiness`] - Rollout and pod waits after a template change
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`cache`] - Reflector-backed caches and event fan-out
//! - [`controller`] - Worker pool and the injection decision
//! - [`api`] - Cluster access seam used by everything above
//! - [`config`] - Controller configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod patch;
pub mod queue;
pub mod rbac;
pub mod readiness;
pub mod retry;
pub mod selector;
pub mod sidecar;
pub mod telemetry;
pub mod workload;

pub use error::Error;
