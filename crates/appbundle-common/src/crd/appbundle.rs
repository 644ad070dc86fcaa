//! AppBundle Custom Resource Definition
//!
//! An AppBundle describes a multi-tier application as ordered groups of
//! ordered components. Each component is either a literal manifest or a
//! reference to an upstream Porch package.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ResourceRef};
use crate::{Error, APPBUNDLE_FINALIZER};

/// Condition type mirroring the bundle phase
pub const READY_CONDITION: &str = "Ready";

/// Package revision used when a package reference omits one
pub const DEFAULT_PACKAGE_REVISION: &str = "v1";

/// Downstream Porch repository used when the bundle omits one
pub const DEFAULT_DOWNSTREAM_REPOSITORY: &str = "deployment";

// =============================================================================
// Phase
// =============================================================================

/// Deployment phase shared by bundles, groups and components
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentPhase {
    /// Nothing has been attempted yet
    #[default]
    Pending,
    /// A reconciliation pass is in progress
    Deploying,
    /// Every resource was applied and reported ready
    Deployed,
    /// A resource failed to apply or become ready
    Failed,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Deploying => write!(f, "Deploying"),
            Self::Deployed => write!(f, "Deployed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Reference to an upstream Porch package
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PorchPackageRef {
    /// Upstream package name
    pub name: String,

    /// Upstream repository (defaults to the package name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Upstream revision (defaults to "v1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Namespace the PackageVariant is created in (defaults to the bundle's)
    ///
    /// Rendered resources still receive the bundle namespace through the
    /// PackageVariant's `namespace` injector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl PorchPackageRef {
    /// Upstream repository, falling back to the package name
    pub fn upstream_repository(&self) -> &str {
        self.repository.as_deref().unwrap_or(&self.name)
    }

    /// Upstream revision, falling back to [`DEFAULT_PACKAGE_REVISION`]
    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(DEFAULT_PACKAGE_REVISION)
    }

    /// Target namespace, falling back to the bundle namespace
    pub fn namespace_or<'a>(&'a self, bundle_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => bundle_namespace,
        }
    }
}

/// A single deployable unit within a group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Component name, unique within its group
    pub name: String,

    /// Position within the group (lower deploys first)
    #[serde(default)]
    pub order: u32,

    /// Literal resource manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: Option<serde_json::Value>,

    /// Reference to an upstream Porch package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub porch_package_ref: Option<PorchPackageRef>,
}

/// Where a component's resources come from
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ComponentSource<'a> {
    /// A literal manifest applied directly
    Template(&'a serde_json::Value),
    /// An upstream package rendered through a PackageVariant
    Package(&'a PorchPackageRef),
}

impl Component {
    /// Resolve the component's source, enforcing exactly one of template or package ref
    pub fn source(&self) -> Result<ComponentSource<'_>, Error> {
        match (&self.template, &self.porch_package_ref) {
            (Some(template), None) => Ok(ComponentSource::Template(template)),
            (None, Some(package)) => Ok(ComponentSource::Package(package)),
            (Some(_), Some(_)) => Err(Error::validation(format!(
                "component '{}' must set exactly one of template or porchPackageRef, found both",
                self.name
            ))),
            (None, None) => Err(Error::validation(format!(
                "component '{}' must set exactly one of template or porchPackageRef, found neither",
                self.name
            ))),
        }
    }
}

/// An ordered collection of components deployed before the next group starts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group name, unique within the bundle
    pub name: String,

    /// Position within the bundle (lower deploys first)
    #[serde(default)]
    pub order: u32,

    /// Components in this group
    pub components: Vec<Component>,
}

/// Porch integration settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PorchIntegrationSpec {
    /// Whether packaged components may be deployed
    #[serde(default)]
    pub enabled: bool,

    /// Downstream repository receiving rendered packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl PorchIntegrationSpec {
    /// Downstream repository, falling back to [`DEFAULT_DOWNSTREAM_REPOSITORY`]
    pub fn downstream_repository(&self) -> &str {
        match self.repository.as_deref() {
            Some(repo) if !repo.is_empty() => repo,
            _ => DEFAULT_DOWNSTREAM_REPOSITORY,
        }
    }
}

/// AppBundle deploys ordered groups of components with readiness gating
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "app.example.com",
    version = "v1alpha1",
    kind = "AppBundle",
    plural = "appbundles",
    shortname = "ab",
    namespaced,
    status = "AppBundleStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppBundleSpec {
    /// Ordered groups of components
    #[serde(default)]
    pub groups: Vec<Group>,

    /// Porch integration settings for packaged components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub porch_integration: Option<PorchIntegrationSpec>,
}

impl AppBundleSpec {
    /// Validate bundle-level structure
    ///
    /// Component sources are checked per component during a pass so the
    /// failure lands on that component's status.
    pub fn validate(&self, bundle: &str) -> Result<(), Error> {
        let mut group_names = BTreeSet::new();
        for (gi, group) in self.groups.iter().enumerate() {
            if group.name.is_empty() {
                return Err(Error::validation_for_field(
                    bundle,
                    format!("spec.groups[{gi}].name"),
                    "group name must not be empty",
                ));
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(Error::validation_for_field(
                    bundle,
                    format!("spec.groups[{gi}].name"),
                    format!("duplicate group name '{}'", group.name),
                ));
            }
            if group.components.is_empty() {
                return Err(Error::validation_for_field(
                    bundle,
                    format!("spec.groups[{gi}].components"),
                    format!("group '{}' has no components", group.name),
                ));
            }

            let mut component_names = BTreeSet::new();
            for (ci, component) in group.components.iter().enumerate() {
                if component.name.is_empty() {
                    return Err(Error::validation_for_field(
                        bundle,
                        format!("spec.groups[{gi}].components[{ci}].name"),
                        "component name must not be empty",
                    ));
                }
                if !component_names.insert(component.name.as_str()) {
                    return Err(Error::validation_for_field(
                        bundle,
                        format!("spec.groups[{gi}].components[{ci}].name"),
                        format!(
                            "duplicate component name '{}' in group '{}'",
                            component.name, group.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns true if packaged components are allowed
    pub fn porch_enabled(&self) -> bool {
        self.porch_integration.as_ref().is_some_and(|p| p.enabled)
    }
}

impl AppBundle {
    /// Returns true if the bundle has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the cleanup finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == APPBUNDLE_FINALIZER))
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of a single component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component name
    pub name: String,

    /// Component phase
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resource produced by the component, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
}

impl ComponentStatus {
    /// Component that deployed and became ready
    pub fn deployed(name: impl Into<String>, message: impl Into<String>, resource: ResourceRef) -> Self {
        Self {
            name: name.into(),
            phase: DeploymentPhase::Deployed,
            message: Some(message.into()),
            resource_ref: Some(resource),
        }
    }

    /// Component that failed
    pub fn failed(name: impl Into<String>, message: impl Into<String>, resource: Option<ResourceRef>) -> Self {
        Self {
            name: name.into(),
            phase: DeploymentPhase::Failed,
            message: Some(message.into()),
            resource_ref: resource,
        }
    }
}

/// Status of a group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    /// Group name
    pub name: String,

    /// Group phase
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-component statuses in deployment order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_statuses: Vec<ComponentStatus>,
}

/// Status for an AppBundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppBundleStatus {
    /// Current phase of the bundle
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-group statuses in deployment order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_statuses: Vec<GroupStatus>,

    /// Generation of the last fully deployed spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the bundle state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AppBundleStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: DeploymentPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the group statuses and return self for chaining
    pub fn groups(mut self, groups: Vec<GroupStatus>) -> Self {
        self.group_statuses = groups;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Schema for embedded manifests: any object, unknown fields preserved
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use kube::CustomResourceExt;
    use serde_json::json;

    fn manifest_component(name: &str, order: u32) -> Component {
        Component {
            name: name.to_string(),
            order,
            template: Some(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name}
            })),
            porch_package_ref: None,
        }
    }

    fn group(name: &str, order: u32, components: Vec<Component>) -> Group {
        Group {
            name: name.to_string(),
            order,
            components,
        }
    }

    #[test]
    fn spec_deserializes_from_yaml_shape() {
        let spec: AppBundleSpec = serde_json::from_value(json!({
            "groups": [{
                "name": "infra",
                "order": 0,
                "components": [{
                    "name": "ns",
                    "template": {"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "shop"}}
                }, {
                    "name": "db",
                    "order": 1,
                    "porchPackageRef": {"name": "postgres", "revision": "v3"}
                }]
            }],
            "porchIntegration": {"enabled": true, "repository": "deploy"}
        }))
        .unwrap();

        assert_eq!(spec.groups.len(), 1);
        let components = &spec.groups[0].components;
        assert_eq!(components[0].order, 0);
        assert!(matches!(components[0].source().unwrap(), ComponentSource::Template(_)));
        assert!(matches!(
            components[1].source().unwrap(),
            ComponentSource::Package(pkg) if pkg.revision() == "v3"
        ));
        assert!(spec.porch_enabled());
        assert_eq!(spec.porch_integration.unwrap().downstream_repository(), "deploy");
    }

    #[test]
    fn component_requires_exactly_one_source() {
        let mut both = manifest_component("web", 0);
        both.porch_package_ref = Some(PorchPackageRef {
            name: "web".into(),
            ..Default::default()
        });
        let err = both.source().unwrap_err();
        assert!(err.to_string().contains("found both"));

        let neither = Component {
            name: "empty".into(),
            ..Default::default()
        };
        let err = neither.source().unwrap_err();
        assert!(err.to_string().contains("found neither"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn package_ref_defaults() {
        let pkg = PorchPackageRef {
            name: "postgres".into(),
            ..Default::default()
        };
        assert_eq!(pkg.upstream_repository(), "postgres");
        assert_eq!(pkg.revision(), DEFAULT_PACKAGE_REVISION);
        assert_eq!(pkg.namespace_or("shop"), "shop");

        let pkg = PorchPackageRef {
            name: "postgres".into(),
            repository: Some("catalog".into()),
            revision: Some("v2".into()),
            namespace: Some("data".into()),
        };
        assert_eq!(pkg.upstream_repository(), "catalog");
        assert_eq!(pkg.revision(), "v2");
        assert_eq!(pkg.namespace_or("shop"), "data");
    }

    #[test]
    fn downstream_repository_defaults() {
        assert_eq!(
            PorchIntegrationSpec::default().downstream_repository(),
            DEFAULT_DOWNSTREAM_REPOSITORY
        );
        let empty = PorchIntegrationSpec {
            enabled: true,
            repository: Some(String::new()),
        };
        assert_eq!(empty.downstream_repository(), DEFAULT_DOWNSTREAM_REPOSITORY);
    }

    #[test]
    fn validate_accepts_well_formed_bundle() {
        let spec = AppBundleSpec {
            groups: vec![
                group("infra", 0, vec![manifest_component("ns", 0)]),
                group("app", 1, vec![manifest_component("web", 0), manifest_component("api", 1)]),
            ],
            porch_integration: None,
        };
        assert!(spec.validate("shop").is_ok());
        assert!(!spec.porch_enabled());
    }

    #[test]
    fn validate_rejects_duplicate_groups_and_components() {
        let spec = AppBundleSpec {
            groups: vec![
                group("app", 0, vec![manifest_component("web", 0)]),
                group("app", 1, vec![manifest_component("api", 0)]),
            ],
            porch_integration: None,
        };
        let err = spec.validate("shop").unwrap_err();
        assert!(err.to_string().contains("duplicate group name 'app'"));

        let spec = AppBundleSpec {
            groups: vec![group(
                "app",
                0,
                vec![manifest_component("web", 0), manifest_component("web", 1)],
            )],
            porch_integration: None,
        };
        let err = spec.validate("shop").unwrap_err();
        assert!(err.to_string().contains("duplicate component name 'web'"));
    }

    #[test]
    fn validate_rejects_empty_group() {
        let spec = AppBundleSpec {
            groups: vec![group("empty", 0, vec![])],
            porch_integration: None,
        };
        let err = spec.validate("shop").unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.groups[0].components"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn status_builder_replaces_conditions_by_type() {
        let status = AppBundleStatus::with_phase(DeploymentPhase::Deploying)
            .condition(Condition::new(READY_CONDITION, ConditionStatus::False, "Deploying", "x"))
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::True,
                "DeploymentComplete",
                "y",
            ))
            .message("done")
            .observed_generation(Some(2));

        assert_eq!(status.conditions.len(), 1);
        let ready = status.get_condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(status.message.as_deref(), Some("done"));
        assert_eq!(status.observed_generation, Some(2));
    }

    #[test]
    fn finalizer_and_deletion_helpers() {
        let mut bundle = AppBundle::new("shop", AppBundleSpec::default());
        assert!(!bundle.has_finalizer());
        assert!(!bundle.is_deleting());

        bundle.metadata.finalizers = Some(vec![APPBUNDLE_FINALIZER.to_string()]);
        bundle.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(bundle.has_finalizer());
        assert!(bundle.is_deleting());
    }

    #[test]
    fn crd_preserves_unknown_fields_in_templates() {
        let crd = serde_json::to_string(&AppBundle::crd()).unwrap();
        assert!(crd.contains("x-kubernetes-preserve-unknown-fields"));
        assert!(crd.contains("appbundles.app.example.com"));
    }

    #[test]
    fn phase_display() {
        assert_eq!(DeploymentPhase::Pending.to_string(), "Pending");
        assert_eq!(DeploymentPhase::Deployed.to_string(), "Deployed");
        assert_eq!(DeploymentPhase::default(), DeploymentPhase::Pending);
    }
}
