//! Cleanup of bundle resources on deletion
//!
//! Components are deleted in reverse deployment order. Namespaced resources
//! in the bundle's namespace also carry an owner reference, so anything
//! missed here is still garbage collected once the finalizer is removed.

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use appbundle_common::crd::{AppBundle, Component, ComponentSource, Group, ResourceRef};
use appbundle_common::manifest::Manifest;
use appbundle_common::Error;

use crate::client::ResourceScope;
use crate::controller::Context;
use crate::orchestrator::plan;
use crate::package::package_variant_ref;
use crate::reconciler::target_ref;

/// What a cleanup run did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Resources deleted
    pub deleted: usize,
    /// Resources that were already gone
    pub missing: usize,
    /// Components whose cleanup failed and was skipped
    pub skipped: usize,
}

/// Resource a component created
async fn cleanup_target(
    ctx: &Context,
    bundle: &AppBundle,
    group: &Group,
    component: &Component,
) -> Result<ResourceRef, Error> {
    match component.source()? {
        ComponentSource::Package(package) => {
            Ok(package_variant_ref(bundle, group, component, package))
        }
        ComponentSource::Template(template) => {
            let mut manifest = Manifest::from_template(&component.name, template)?;
            let scope = ctx
                .cluster
                .scope(manifest.api_version(), manifest.kind())
                .await?;
            if scope == ResourceScope::Namespaced {
                manifest.default_namespace(&bundle.namespace().unwrap_or_default());
            }
            Ok(target_ref(&manifest, scope))
        }
    }
}

/// Delete every component's resource, last group first
///
/// Failures are logged and skipped so one stuck resource cannot block
/// removal of the finalizer.
#[instrument(skip(ctx, bundle), fields(bundle = %bundle.name_any()))]
pub async fn finalize(ctx: &Context, bundle: &AppBundle) -> CleanupSummary {
    let mut summary = CleanupSummary::default();

    for (group, components) in plan(&bundle.spec.groups).into_iter().rev() {
        for component in components.into_iter().rev() {
            let target = match cleanup_target(ctx, bundle, group, component).await {
                Ok(target) => target,
                Err(e) => {
                    warn!(
                        group = %group.name,
                        component = %component.name,
                        error = %e,
                        "cannot resolve component resource, skipping cleanup"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            match ctx.cluster.delete(&target).await {
                Ok(true) => {
                    info!(kind = %target.kind, name = %target.name, "deleted resource");
                    summary.deleted += 1;
                }
                Ok(false) => {
                    debug!(kind = %target.kind, name = %target.name, "resource already gone");
                    summary.missing += 1;
                }
                Err(e) if e.is_not_found() => summary.missing += 1,
                Err(e) => {
                    warn!(
                        kind = %target.kind,
                        name = %target.name,
                        error = %e,
                        "failed to delete resource"
                    );
                    summary.skipped += 1;
                }
            }
        }
    }

    summary
}
