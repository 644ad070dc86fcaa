//! AppBundle reconciliation engine
//!
//! Deploys an AppBundle's groups and components strictly in order, waiting
//! for each resource to become ready before the next one starts. Literal
//! manifests are applied directly; packaged components go through Porch
//! PackageVariants with a synthesized wait gate so the GitOps sync engine
//! honors the same ordering.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod finalizer;
pub mod orchestrator;
pub mod package;
pub mod readiness;
pub mod reconciler;
pub mod status;

#[cfg(test)]
mod testing;

pub use controller::{error_policy, reconcile, Context, ControllerConfig};
