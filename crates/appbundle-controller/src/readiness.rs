//! Per-kind readiness predicates and the polling wait built on them

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use appbundle_common::crd::ResourceRef;
use appbundle_common::kube_utils::{poll_until, DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT};
use appbundle_common::manifest::Manifest;
use appbundle_common::Error;

use crate::client::ClusterClient;

/// Kinds considered ready as soon as the API server accepts them
pub const IMMEDIATELY_READY_KINDS: &[&str] = &[
    "Namespace",
    "ConfigMap",
    "Secret",
    "Service",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "Ingress",
    "NetworkPolicy",
];

/// Poll cadence and upper bound for a single wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay between checks
    pub poll_interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

/// How a kind decides it is ready
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// No polling at all
    Immediate,
    /// Ready, updated and available replicas all match spec.replicas
    Deployment,
    /// Ready replicas match spec.replicas
    StatefulSet,
    /// Every desired pod is ready, and at least one is desired
    DaemonSet,
    /// Complete=True, with Failed=True terminal
    Job,
    /// Ready=True
    Pod,
    /// The named status condition is True
    Condition(&'static str),
    /// Existence is enough
    Exists,
}

impl Predicate {
    /// Predicate for a kind
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            k if IMMEDIATELY_READY_KINDS.contains(&k) => Self::Immediate,
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "Job" => Self::Job,
            "Pod" => Self::Pod,
            "PackageVariant" => Self::Condition("Ready"),
            _ => Self::Exists,
        }
    }

    /// Evaluate against the live object
    ///
    /// `Ok(false)` means keep waiting. An error means the workload failed
    /// and waiting longer will not help.
    pub fn check(self, current: &Manifest) -> Result<bool, Error> {
        match self {
            Self::Immediate | Self::Exists => Ok(true),
            Self::Deployment => Ok(deployment_ready(current)),
            Self::StatefulSet => Ok(statefulset_ready(current)),
            Self::DaemonSet => Ok(daemonset_ready(current)),
            Self::Job => job_complete(current),
            Self::Pod => Ok(current.condition_true("Ready")),
            Self::Condition(type_) => Ok(current.condition_true(type_)),
        }
    }
}

fn desired_replicas(m: &Manifest) -> i64 {
    m.i64_at(&["spec", "replicas"]).unwrap_or(1)
}

fn status_count(m: &Manifest, field: &str) -> i64 {
    m.i64_at(&["status", field]).unwrap_or(0)
}

fn deployment_ready(m: &Manifest) -> bool {
    let desired = desired_replicas(m);
    status_count(m, "readyReplicas") == desired
        && status_count(m, "updatedReplicas") == desired
        && status_count(m, "availableReplicas") == desired
}

fn statefulset_ready(m: &Manifest) -> bool {
    status_count(m, "readyReplicas") == desired_replicas(m)
}

fn daemonset_ready(m: &Manifest) -> bool {
    let desired = status_count(m, "desiredNumberScheduled");
    desired > 0 && status_count(m, "numberReady") == desired
}

fn job_complete(m: &Manifest) -> Result<bool, Error> {
    if m.condition_true("Complete") {
        return Ok(true);
    }
    if m.condition_true("Failed") {
        let message = m.condition_message("Failed").unwrap_or("job failed");
        return Err(Error::workload_failed("Job", m.name(), message));
    }
    Ok(false)
}

/// Block until `target` satisfies its kind's predicate
///
/// Not-found counts as not ready yet. API errors other than not-found end
/// the wait with that error, as does a workload failure. Cancellation
/// returns [`Error::Cancelled`].
pub async fn wait_ready(
    client: &dyn ClusterClient,
    target: &ResourceRef,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let predicate = Predicate::for_kind(&target.kind);
    if predicate == Predicate::Immediate {
        debug!(kind = %target.kind, name = %target.name, "kind is ready on creation");
        return Ok(());
    }

    poll_until(
        cancel,
        policy.timeout,
        policy.poll_interval,
        || Error::readiness_timeout(&target.kind, &target.name, policy.timeout),
        move || async move {
            match client.get(target).await? {
                Some(current) => predicate.check(&current),
                None => {
                    debug!(kind = %target.kind, name = %target.name, "resource not found yet");
                    Ok(false)
                }
            }
        },
    )
    .await?;

    info!(kind = %target.kind, name = %target.name, "resource is ready");
    Ok(())
}
