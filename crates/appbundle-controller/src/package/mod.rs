//! Porch package integration
//!
//! A packaged component is deployed by creating a PackageVariant that
//! clones the upstream package into the downstream repository. The
//! variant's pipeline stamps sync waves and tracking labels on every
//! rendered resource and appends a wait gate for the GitOps engine.

pub mod discovery;
pub mod gate;
pub mod variant;

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use appbundle_common::crd::{AppBundle, Component, Group, PorchPackageRef, ResourceRef};
use appbundle_common::Error;

use crate::controller::Context;
use crate::readiness::wait_ready;
use crate::status::{ComponentFailure, Stage};

pub use gate::GateConfig;
pub use variant::{build_package_variant, package_variant_name, package_variant_ref};

/// Deploy a packaged component through a PackageVariant
///
/// An existing PackageVariant is left as is; Porch owns its lifecycle once
/// created. Returns once the variant reports Ready and its rendered
/// workloads have been waited on.
#[instrument(
    skip(ctx, bundle, group, component, package),
    fields(bundle = %bundle.name_any(), group = %group.name, component = %component.name)
)]
pub async fn reconcile_packaged(
    ctx: &Context,
    bundle: &AppBundle,
    group: &Group,
    component: &Component,
    package: &PorchPackageRef,
    wave: i64,
) -> Result<ResourceRef, ComponentFailure> {
    if !bundle.spec.porch_enabled() {
        return Err(ComponentFailure::new(
            Stage::PackageSpec,
            Error::package(&package.name, "porch integration is not enabled"),
        ));
    }

    let variant =
        build_package_variant(bundle, group, component, package, wave, &ctx.config.gate)
            .map_err(|e| ComponentFailure::new(Stage::PackageSpec, e))?;
    let target = variant.resource_ref();
    let fail = |stage: Stage| {
        let target = target.clone();
        move |e: Error| ComponentFailure::new(stage, e).on(target)
    };

    match ctx
        .cluster
        .get(&target)
        .await
        .map_err(fail(Stage::PackageLookup))?
    {
        Some(_) => debug!(package_variant = %target.name, "PackageVariant already exists"),
        None => {
            info!(
                package_variant = %target.name,
                upstream = %package.name,
                "creating PackageVariant"
            );
            ctx.cluster
                .create(&variant)
                .await
                .map_err(fail(Stage::PackageCreate))?;
        }
    }

    wait_ready(
        ctx.cluster.as_ref(),
        &target,
        &ctx.config.readiness(),
        &ctx.cancel,
    )
    .await
    .map_err(fail(Stage::PackageReady))?;

    let downstream_repo = bundle
        .spec
        .porch_integration
        .as_ref()
        .map(|p| p.downstream_repository())
        .unwrap_or_default();
    discovery::wait_for_rendered(
        ctx,
        &target,
        downstream_repo,
        &bundle.namespace().unwrap_or_default(),
    )
    .await;

    Ok(target)
}
