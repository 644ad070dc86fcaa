//! Kubernetes Event recording for the AppBundle controller.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason string (e.g. "DeploymentComplete")
    /// * `action` - What action was taken (e.g. "Deploy")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// A reconciliation pass started deploying groups
    pub const DEPLOYMENT_STARTED: &str = "DeploymentStarted";
    /// Every group deployed and reported ready
    pub const DEPLOYMENT_COMPLETE: &str = "DeploymentComplete";
    /// A component failed and the pass was aborted
    pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";
    /// Bundle spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Finalizer cleanup started
    pub const CLEANUP_STARTED: &str = "CleanupStarted";
    /// Finalizer cleanup finished and the finalizer was removed
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    /// Deploying groups and components
    pub const DEPLOY: &str = "Deploy";
    /// Deleting bundle resources
    pub const DELETE: &str = "Delete";
}
