//! Error types for the backup sidecar operator
//!
//! Every helper returns a classifiable [`Error`]. The worker loop does not
//! branch on the class; it retries uniformly up to the requeue cap. The
//! Patch Engine's inner retry does branch: [`Error::is_retryable`] decides
//! whether another attempt is made within one reconcile.

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is neither NotFound nor transient
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The referenced object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Object kind (e.g., "Secret")
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// Conflict, throttling, server or network failure
    #[error("transient error: {0}")]
    Transient(String),

    /// The desired state cannot be computed from the current inputs
    #[error("validation error: {0}")]
    Validation(String),

    /// More than one Backup selects the same workload
    #[error("workload {workload} is selected by multiple backups: {}", .backups.join(", "))]
    AmbiguousMatch {
        /// Workload key (namespace/name)
        workload: String,
        /// Names of all matching backups
        backups: Vec<String>,
    },

    /// A rollout or sidecar wait exceeded its bound
    #[error("timed out waiting for {0}")]
    ReadinessTimeout(String),

    /// Canonical serialization or diff computation failed
    #[error("patch computation error: {0}")]
    PatchComputation(String),

    /// A bounded retry loop gave up
    #[error("failed to {operation} {kind} {key} after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Operation name ("patch", "update")
        operation: &'static str,
        /// Object kind
        kind: String,
        /// Object key (namespace/name)
        key: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last error observed
        #[source]
        source: Box<Error>,
    },

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a not-found error for an object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a readiness timeout error naming what was awaited
    pub fn readiness_timeout(what: impl Into<String>) -> Self {
        Self::ReadinessTimeout(what.into())
    }

    /// Create a patch computation error with the given message
    pub fn patch_computation(msg: impl Into<String>) -> Self {
        Self::PatchComputation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify a kube-rs error for an object identified by kind/namespace/name.
    ///
    /// 404 becomes [`Error::NotFound`]; 409, 429, 5xx and transport failures
    /// become [`Error::Transient`]; everything else stays [`Error::Kube`].
    pub fn from_kube(kind: &str, namespace: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(resp) if resp.code == 409 || resp.code == 429 || resp.code >= 500 => {
                Self::transient(format!("{kind} {namespace}/{name}: {}", resp.message))
            }
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Self::transient(format!("{kind} {namespace}/{name}: {err}"))
            }
            _ => Self::Kube(err),
        }
    }

    /// Whether this error is a NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the same operation may succeed without an external change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::ReadinessTimeout(_) => true,
            Self::Kube(_) => true,
            Self::RetryExhausted { .. } => true,
            Self::NotFound { .. }
            | Self::Validation(_)
            | Self::AmbiguousMatch { .. }
            | Self::PatchComputation(_)
            | Self::Config(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::PatchComputation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors_by_status_code() {
        assert!(Error::from_kube("Secret", "default", "s3-creds", api_error(404)).is_not_found());
        assert!(matches!(
            Error::from_kube("Deployment", "default", "web", api_error(409)),
            Error::Transient(_)
        ));
        assert!(matches!(
            Error::from_kube("Deployment", "default", "web", api_error(503)),
            Error::Transient(_)
        ));
        assert!(matches!(
            Error::from_kube("Deployment", "default", "web", api_error(422)),
            Error::Kube(_)
        ));
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!Error::not_found("Secret", "default", "s3-creds").is_retryable());
        assert!(!Error::validation("missing secret name").is_retryable());
        assert!(!Error::patch_computation("bad json").is_retryable());
        assert!(!Error::AmbiguousMatch {
            workload: "default/web".to_string(),
            backups: vec!["a".to_string(), "b".to_string()],
        }
        .is_retryable());
    }

    #[test]
    fn transient_and_timeouts_are_retryable() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::readiness_timeout("rollout of Deployment default/web").is_retryable());
    }

    #[test]
    fn ambiguous_match_names_every_backup() {
        let err = Error::AmbiguousMatch {
            workload: "default/web".to_string(),
            backups: vec!["nightly".to_string(), "hourly".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("default/web"));
        assert!(msg.contains("nightly, hourly"));
    }

    #[test]
    fn retry_exhaustion_names_identity_and_attempts() {
        let err = Error::RetryExhausted {
            operation: "patch",
            kind: "Deployment".to_string(),
            key: "default/web".to_string(),
            attempts: 4,
            source: Box::new(Error::transient("conflict")),
        };
        let msg = err.to_string();
        assert!(msg.contains("Deployment default/web"));
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("conflict"));
    }
}
