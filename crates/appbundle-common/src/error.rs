//! Error types for the AppBundle operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant maps onto one failure category of a reconciliation pass,
//! and every variant that reaches a component marks it Failed.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for AppBundle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (get/create/update/delete against the cluster)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A component manifest could not be turned into a structured resource
    #[error("manifest parse error for {component}: {message}")]
    ManifestParse {
        /// Name of the component whose manifest is malformed
        component: String,
        /// Description of what's malformed
        message: String,
    },

    /// Validation error for AppBundle specs
    #[error("validation error for {bundle}: {message}")]
    Validation {
        /// Name of the bundle with invalid configuration
        bundle: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.groups[0].components[1]")
        field: Option<String>,
    },

    /// A readiness predicate never held within the polling window
    #[error("timed out after {}s waiting for {kind}/{name} to become ready", timeout.as_secs())]
    ReadinessTimeout {
        /// Kind of the resource being waited on
        kind: String,
        /// Name of the resource being waited on
        name: String,
        /// The window that elapsed
        timeout: Duration,
    },

    /// A workload reported an explicit, terminal failure
    #[error("{kind}/{name} failed: {message}")]
    WorkloadFailed {
        /// Kind of the failed workload
        kind: String,
        /// Name of the failed workload
        name: String,
        /// Failure detail taken from the workload's status
        message: String,
    },

    /// PackageVariant creation, spec building or readiness failure
    #[error("package integration error for {package}: {message}")]
    PackageIntegration {
        /// Package (or PackageVariant) the error relates to
        package: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The surrounding context was cancelled (e.g. process shutdown)
    #[error("cancelled [{context}]")]
    Cancelled {
        /// What was in progress when cancellation arrived
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a manifest parse error for a component
    pub fn manifest_parse(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManifestParse {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without bundle context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            bundle: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with bundle context
    pub fn validation_for(bundle: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            bundle: bundle.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with bundle context and field path
    pub fn validation_for_field(
        bundle: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            bundle: bundle.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(kind: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Self {
        Self::ReadinessTimeout {
            kind: kind.into(),
            name: name.into(),
            timeout,
        }
    }

    /// Create a workload failure error
    pub fn workload_failed(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::WorkloadFailed {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a package integration error
    pub fn package(package: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PackageIntegration {
            package: package.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if this error is transient and the pass should be retried
    ///
    /// Malformed manifests, invalid specs and explicit workload failures need
    /// a spec change before another pass can succeed. Only 400 and 422
    /// rejections of the object itself count as permanent API errors; a kind
    /// that is not served yet (404) or RBAC still propagating (403) clears on
    /// a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => !matches!(ae.code, 400 | 422),
                _ => true,
            },
            Error::ManifestParse { .. } => false,
            Error::Validation { .. } => false,
            Error::ReadinessTimeout { .. } => true,
            Error::WorkloadFailed { .. } => false,
            Error::PackageIntegration { .. } => true,
            Error::Serialization { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
