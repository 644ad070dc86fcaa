//! Status aggregation: component, group and bundle phases plus the Ready condition

use appbundle_common::crd::{
    AppBundle, AppBundleStatus, ComponentStatus, Condition, ConditionStatus, DeploymentPhase,
    GroupStatus, ResourceRef, READY_CONDITION,
};
use appbundle_common::Error;

/// Bundle message after every group deployed
pub const BUNDLE_DEPLOYED_MESSAGE: &str = "All groups deployed successfully";
/// Group message after every component deployed
pub const GROUP_DEPLOYED_MESSAGE: &str = "All components deployed successfully";
/// Component message for a literal manifest that became ready
pub const RESOURCE_DEPLOYED_MESSAGE: &str = "Resource deployed successfully";
/// Component message for a PackageVariant that became ready
pub const PACKAGE_DEPLOYED_MESSAGE: &str = "PackageVariant deployed successfully via Porch";

/// Ready condition reasons
pub mod reasons {
    /// Every group deployed
    pub const DEPLOYMENT_COMPLETE: &str = "DeploymentComplete";
    /// A component failed
    pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";
    /// A pass is running
    pub const DEPLOYING: &str = "Deploying";
}

/// Where in a component's deployment a failure happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// The component declares neither or both sources
    Source,
    /// The template is not a usable manifest
    Parse,
    /// Probing for an existing object failed
    Lookup,
    /// Creating the object failed
    Create,
    /// Replacing the object failed
    Update,
    /// The object never became ready
    Ready,
    /// Building the PackageVariant failed
    PackageSpec,
    /// Probing for an existing PackageVariant failed
    PackageLookup,
    /// Creating the PackageVariant failed
    PackageCreate,
    /// The PackageVariant never became ready
    PackageReady,
}

impl Stage {
    fn describe(self, error: &Error) -> String {
        match self {
            Self::Source => format!("Invalid component: {error}"),
            Self::Parse => format!("Failed to parse template: {error}"),
            Self::Lookup => format!("Failed to get existing resource: {error}"),
            Self::Create => format!("Failed to create resource: {error}"),
            Self::Update => format!("Failed to update resource: {error}"),
            Self::Ready => format!("Resource not ready: {error}"),
            Self::PackageSpec => format!("Failed to set PackageVariant spec: {error}"),
            Self::PackageLookup => format!("Failed to get PackageVariant: {error}"),
            Self::PackageCreate => format!("Failed to create PackageVariant: {error}"),
            Self::PackageReady => format!("PackageVariant not ready: {error}"),
        }
    }
}

/// A component that failed, with enough context to fill in its status
#[derive(Debug)]
pub struct ComponentFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Underlying error
    pub error: Error,
    /// Resource the component targets, if it got far enough to know
    pub resource: Option<ResourceRef>,
}

impl ComponentFailure {
    /// Failure at `stage`
    pub fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            error,
            resource: None,
        }
    }

    /// Attach the targeted resource
    pub fn on(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Component status message
    pub fn message(&self) -> String {
        self.stage.describe(&self.error)
    }

    /// Status for the failed component
    pub fn status(&self, component: &str) -> ComponentStatus {
        ComponentStatus::failed(component, self.message(), self.resource.clone())
    }
}

/// Result of one pass over the bundle
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Status of every group attempted, in deployment order
    pub groups: Vec<GroupStatus>,
    /// The failure that aborted the pass, if any
    pub failure: Option<(String, ComponentFailure)>,
}

impl PassOutcome {
    /// Returns true if every group deployed
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Group whose components all deployed
pub fn group_deployed(name: &str, components: Vec<ComponentStatus>) -> GroupStatus {
    GroupStatus {
        name: name.to_string(),
        phase: DeploymentPhase::Deployed,
        message: Some(GROUP_DEPLOYED_MESSAGE.to_string()),
        component_statuses: components,
    }
}

/// Group aborted by a failing component
///
/// `components` holds the statuses of the components that ran, the failed
/// one last.
pub fn group_failed(
    name: &str,
    component: &str,
    failure: &ComponentFailure,
    components: Vec<ComponentStatus>,
) -> GroupStatus {
    GroupStatus {
        name: name.to_string(),
        phase: DeploymentPhase::Failed,
        message: Some(format!(
            "Failed to deploy component {component}: {}",
            failure.error
        )),
        component_statuses: components,
    }
}

/// Ready condition, keeping the previous transition time when the status did not change
pub fn ready_condition(
    previous: Option<&AppBundleStatus>,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    let mut condition =
        Condition::new(READY_CONDITION, status, reason, message).observed(generation);
    if let Some(prev) = previous.and_then(|s| s.get_condition(READY_CONDITION)) {
        if prev.status == condition.status {
            condition.last_transition_time = prev.last_transition_time;
        }
    }
    condition
}

/// Status written before the first pass
pub fn pending_status() -> AppBundleStatus {
    AppBundleStatus::with_phase(DeploymentPhase::Pending).message("Waiting for deployment")
}

/// Status written when a pass starts
///
/// Group statuses from the previous pass are kept until the pass finishes.
pub fn deploying_status(bundle: &AppBundle) -> AppBundleStatus {
    let previous = bundle.status.as_ref();
    AppBundleStatus {
        group_statuses: previous.map(|s| s.group_statuses.clone()).unwrap_or_default(),
        observed_generation: previous.and_then(|s| s.observed_generation),
        conditions: previous.map(|s| s.conditions.clone()).unwrap_or_default(),
        ..AppBundleStatus::with_phase(DeploymentPhase::Deploying)
    }
    .message("Deployment in progress")
    .condition(ready_condition(
        previous,
        ConditionStatus::False,
        reasons::DEPLOYING,
        "Deployment in progress",
        bundle.metadata.generation,
    ))
}

/// Status written when a pass finishes
///
/// `deploying` is the status written when the pass started, so the Ready
/// transition time is measured from the Deploying condition.
pub fn terminal_status(
    bundle: &AppBundle,
    deploying: &AppBundleStatus,
    outcome: &PassOutcome,
) -> AppBundleStatus {
    let generation = bundle.metadata.generation;
    let base = AppBundleStatus {
        conditions: deploying.conditions.clone(),
        ..Default::default()
    };

    match &outcome.failure {
        None => AppBundleStatus {
            phase: DeploymentPhase::Deployed,
            ..base
        }
        .message(BUNDLE_DEPLOYED_MESSAGE)
        .groups(outcome.groups.clone())
        .observed_generation(generation)
        .condition(ready_condition(
            Some(deploying),
            ConditionStatus::True,
            reasons::DEPLOYMENT_COMPLETE,
            "All resources deployed successfully",
            generation,
        )),
        Some((_, failure)) => {
            let message = failure.error.to_string();
            AppBundleStatus {
                phase: DeploymentPhase::Failed,
                observed_generation: deploying.observed_generation,
                ..base
            }
            .message(message.clone())
            .groups(outcome.groups.clone())
            .condition(ready_condition(
                Some(deploying),
                ConditionStatus::False,
                reasons::DEPLOYMENT_FAILED,
                message,
                generation,
            ))
        }
    }
}

/// Status written when the bundle spec itself is invalid
pub fn invalid_status(bundle: &AppBundle, error: &Error) -> AppBundleStatus {
    let previous = bundle.status.as_ref();
    AppBundleStatus {
        conditions: previous.map(|s| s.conditions.clone()).unwrap_or_default(),
        observed_generation: previous.and_then(|s| s.observed_generation),
        ..AppBundleStatus::with_phase(DeploymentPhase::Failed)
    }
    .message(error.to_string())
    .condition(ready_condition(
        previous,
        ConditionStatus::False,
        reasons::DEPLOYMENT_FAILED,
        error.to_string(),
        bundle.metadata.generation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use appbundle_common::crd::AppBundleSpec;
    use std::time::Duration;

    fn bundle(generation: i64, status: Option<AppBundleStatus>) -> AppBundle {
        let mut b = AppBundle::new("shop", AppBundleSpec::default());
        b.metadata.namespace = Some("shop".to_string());
        b.metadata.generation = Some(generation);
        b.status = status;
        b
    }

    fn finish(bundle: &AppBundle, outcome: &PassOutcome) -> AppBundleStatus {
        terminal_status(bundle, &deploying_status(bundle), outcome)
    }

    fn deployed_component(name: &str) -> ComponentStatus {
        ComponentStatus::deployed(
            name,
            RESOURCE_DEPLOYED_MESSAGE,
            ResourceRef::new("v1", "Namespace", name, None),
        )
    }

    #[test]
    fn stage_messages() {
        let err = Error::manifest_parse("web", "manifest missing kind");
        assert_eq!(
            ComponentFailure::new(Stage::Parse, err).message(),
            "Failed to parse template: manifest parse error for web: manifest missing kind"
        );

        let err = Error::readiness_timeout("Job", "migrate", Duration::from_secs(300));
        assert_eq!(
            ComponentFailure::new(Stage::Ready, err).message(),
            "Resource not ready: timed out after 300s waiting for Job/migrate to become ready"
        );

        let err = Error::package("pv", "not ready");
        assert!(ComponentFailure::new(Stage::PackageReady, err)
            .message()
            .starts_with("PackageVariant not ready: "));
    }

    #[test]
    fn successful_pass_rolls_up_to_deployed() {
        let outcome = PassOutcome {
            groups: vec![
                group_deployed("infra", vec![deployed_component("ns")]),
                group_deployed("app", vec![deployed_component("web")]),
            ],
            failure: None,
        };
        let status = finish(&bundle(4, None), &outcome);

        assert_eq!(status.phase, DeploymentPhase::Deployed);
        assert_eq!(status.message.as_deref(), Some(BUNDLE_DEPLOYED_MESSAGE));
        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.group_statuses.len(), 2);
        assert_eq!(
            status.group_statuses[0].message.as_deref(),
            Some(GROUP_DEPLOYED_MESSAGE)
        );

        let ready = status.get_condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, reasons::DEPLOYMENT_COMPLETE);
        assert_eq!(ready.observed_generation, Some(4));
    }

    #[test]
    fn failure_marks_component_group_and_bundle() {
        let failure = ComponentFailure::new(
            Stage::Parse,
            Error::manifest_parse("web", "manifest missing kind"),
        );
        let group = group_failed("app", "web", &failure, vec![failure.status("web")]);
        let outcome = PassOutcome {
            groups: vec![group_deployed("infra", vec![deployed_component("ns")]), group],
            failure: Some(("web".to_string(), failure)),
        };
        let status = finish(&bundle(2, None), &outcome);

        assert_eq!(status.phase, DeploymentPhase::Failed);
        assert_eq!(
            status.message.as_deref(),
            Some("manifest parse error for web: manifest missing kind")
        );
        assert_eq!(status.observed_generation, None);

        let app = &status.group_statuses[1];
        assert_eq!(app.phase, DeploymentPhase::Failed);
        assert_eq!(
            app.message.as_deref(),
            Some("Failed to deploy component web: manifest parse error for web: manifest missing kind")
        );
        assert_eq!(app.component_statuses[0].phase, DeploymentPhase::Failed);
        assert!(app.component_statuses[0]
            .message
            .as_deref()
            .unwrap()
            .starts_with("Failed to parse template: "));

        let ready = status.get_condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::DEPLOYMENT_FAILED);
    }

    #[test]
    fn deploying_keeps_previous_groups_and_transition_time() {
        let outcome = PassOutcome {
            groups: vec![group_deployed("infra", vec![deployed_component("ns")])],
            failure: None,
        };
        let deployed = finish(&bundle(1, None), &outcome);

        let status = deploying_status(&bundle(2, Some(deployed.clone())));
        assert_eq!(status.phase, DeploymentPhase::Deploying);
        assert_eq!(status.group_statuses, deployed.group_statuses);
        assert_eq!(status.observed_generation, Some(1));
        let ready = status.get_condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::DEPLOYING);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn failed_pass_keeps_deploying_transition_time() {
        let b = bundle(1, None);
        let deploying = deploying_status(&b);
        std::thread::sleep(Duration::from_millis(5));
        let failure = ComponentFailure::new(
            Stage::Create,
            Error::internal("admission webhook denied"),
        );
        let failed = terminal_status(
            &b,
            &deploying,
            &PassOutcome {
                groups: vec![],
                failure: Some(("web".to_string(), failure)),
            },
        );
        assert_eq!(
            deploying.get_condition(READY_CONDITION).unwrap().last_transition_time,
            failed.get_condition(READY_CONDITION).unwrap().last_transition_time
        );
    }

    #[test]
    fn redeploy_moves_ready_transition_forward() {
        let empty = || PassOutcome {
            groups: vec![],
            failure: None,
        };
        let first = finish(&bundle(1, None), &empty());
        let first_ready = first.get_condition(READY_CONDITION).unwrap().clone();

        std::thread::sleep(Duration::from_millis(5));
        let redeploy = bundle(2, Some(first));
        let deploying = deploying_status(&redeploy);
        let flipped = deploying.get_condition(READY_CONDITION).unwrap().clone();
        assert_eq!(flipped.status, ConditionStatus::False);
        assert!(flipped.last_transition_time > first_ready.last_transition_time);

        std::thread::sleep(Duration::from_millis(5));
        let second = terminal_status(&redeploy, &deploying, &empty());
        let ready = second.get_condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert!(ready.last_transition_time > flipped.last_transition_time);
    }

    #[test]
    fn pending_and_invalid() {
        assert_eq!(pending_status().phase, DeploymentPhase::Pending);

        let err = Error::validation_for("shop", "duplicate group name 'app'");
        let status = invalid_status(&bundle(3, None), &err);
        assert_eq!(status.phase, DeploymentPhase::Failed);
        assert!(status.message.as_deref().unwrap().contains("duplicate group name"));
        assert_eq!(
            status.get_condition(READY_CONDITION).unwrap().reason,
            reasons::DEPLOYMENT_FAILED
        );
    }
}
