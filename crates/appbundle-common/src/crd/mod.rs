//! Custom Resource Definitions for AppBundle

mod appbundle;
mod types;

pub use appbundle::{
    AppBundle, AppBundleSpec, AppBundleStatus, Component, ComponentSource, ComponentStatus,
    DeploymentPhase, Group, GroupStatus, PorchIntegrationSpec, PorchPackageRef,
    DEFAULT_DOWNSTREAM_REPOSITORY, DEFAULT_PACKAGE_REVISION, READY_CONDITION,
};
pub use types::{Condition, ConditionStatus, ResourceRef};
