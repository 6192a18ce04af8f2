//! Controller configuration
//!
//! The core only consumes a [`ControllerConfig`] value. How it is loaded (CLI
//! flags with environment fallbacks) lives in `main.rs`.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::Error;

/// Default sidecar image repository
pub const DEFAULT_SIDECAR_IMAGE: &str = "appscode/stash";

/// Default number of whole-reconcile retries before a key is dropped
pub const DEFAULT_MAX_NUM_REQUEUES: u32 = 5;

/// Default ClusterRole bound to sidecar service accounts when RBAC is enabled
pub const DEFAULT_SIDECAR_CLUSTER_ROLE: &str = "backup-sidecar";

/// Values consumed by the queue, patch engine and decision logic
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Manage a RoleBinding for each injected workload
    pub enable_rbac: bool,
    /// Sidecar image repository (without tag)
    pub sidecar_image: String,
    /// Sidecar image tag, recorded in the version annotation
    pub sidecar_image_tag: String,
    /// ClusterRole referenced by sidecar RoleBindings
    pub sidecar_cluster_role: String,
    /// Requeues allowed per key before it is dropped
    pub max_num_requeues: u32,
    /// Interval at which every cached workload is re-enqueued
    pub resync_period: Duration,
    /// Patch Engine fixed retry interval
    pub retry_interval: Duration,
    /// Patch Engine retry deadline
    pub retry_timeout: Duration,
    /// Poll interval for rollout and sidecar waits
    pub readiness_interval: Duration,
    /// Deadline for each rollout or sidecar wait
    pub readiness_timeout: Duration,
    /// Concurrent workers per workload kind
    pub workers: usize,
    /// Restrict watches to one namespace (None = all namespaces)
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_rbac: false,
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            sidecar_image_tag: env!("CARGO_PKG_VERSION").to_string(),
            sidecar_cluster_role: DEFAULT_SIDECAR_CLUSTER_ROLE.to_string(),
            max_num_requeues: DEFAULT_MAX_NUM_REQUEUES,
            resync_period: Duration::from_secs(300),
            retry_interval: Duration::from_secs(2),
            retry_timeout: Duration::from_secs(180),
            readiness_interval: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(300),
            workers: 2,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.sidecar_image.is_empty() {
            return Err(Error::config("sidecar image must not be empty"));
        }
        if self.sidecar_image_tag.is_empty() {
            return Err(Error::config("sidecar image tag must not be empty"));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::config("retry interval must be greater than zero"));
        }
        if self.retry_interval > self.retry_timeout {
            return Err(Error::config(format!(
                "retry interval {:?} exceeds retry timeout {:?}",
                self.retry_interval, self.retry_timeout
            )));
        }
        if self.readiness_interval.is_zero() {
            return Err(Error::config("readiness interval must be greater than zero"));
        }
        Ok(())
    }

    /// Full sidecar image reference (`image:tag`)
    pub fn sidecar_image_ref(&self) -> String {
        format!("{}:{}", self.sidecar_image, self.sidecar_image_tag)
    }

    /// Retry policy for the Patch Engine's inner loop
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_interval, self.retry_timeout)
    }

    /// Retry policy for rollout and sidecar waits
    pub fn readiness_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.readiness_interval, self.readiness_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_num_requeues, 5);
        assert!(!config.enable_rbac);
    }

    #[test]
    fn rejects_zero_workers() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_tag() {
        let config = ControllerConfig {
            sidecar_image_tag: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_interval_longer_than_timeout() {
        let config = ControllerConfig {
            retry_interval: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds retry timeout"));
    }

    #[test]
    fn image_ref_joins_repository_and_tag() {
        let config = ControllerConfig {
            sidecar_image: "registry.local/stash".to_string(),
            sidecar_image_tag: "0.6.1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.sidecar_image_ref(), "registry.local/stash:0.6.1");
    }
}
