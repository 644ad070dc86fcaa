//! Ordering, sync waves and the sequential deployment pass

use kube::ResourceExt;
use tracing::{error, info, instrument};

use appbundle_common::crd::{AppBundle, Component, ComponentSource, ComponentStatus, Group};
use appbundle_common::WAVES_PER_GROUP;

use crate::controller::Context;
use crate::package::reconcile_packaged;
use crate::reconciler;
use crate::status::{
    group_deployed, group_failed, ComponentFailure, PassOutcome, Stage, PACKAGE_DEPLOYED_MESSAGE,
    RESOURCE_DEPLOYED_MESSAGE,
};

/// Sync wave for a component
///
/// Waves from a lower-ordered group stay below every wave of a
/// higher-ordered group as long as each group has fewer than
/// [`WAVES_PER_GROUP`] component orders in use.
pub fn sync_wave(group_order: u32, component_order: u32) -> i64 {
    i64::from(group_order) * WAVES_PER_GROUP + i64::from(component_order)
}

/// Sync wave for a group's wait gate: after the group, before the next one
pub fn gate_wave(group_order: u32) -> i64 {
    i64::from(group_order) * WAVES_PER_GROUP + (WAVES_PER_GROUP - 1)
}

/// Groups and their components in deployment order
///
/// Sorting is stable, so equal orders keep their declaration order.
pub fn plan(groups: &[Group]) -> Vec<(&Group, Vec<&Component>)> {
    let mut sorted: Vec<&Group> = groups.iter().collect();
    sorted.sort_by_key(|g| g.order);
    sorted
        .into_iter()
        .map(|group| {
            let mut components: Vec<&Component> = group.components.iter().collect();
            components.sort_by_key(|c| c.order);
            (group, components)
        })
        .collect()
}

async fn deploy_component(
    ctx: &Context,
    bundle: &AppBundle,
    group: &Group,
    component: &Component,
) -> Result<ComponentStatus, ComponentFailure> {
    let wave = sync_wave(group.order, component.order);
    let source = component
        .source()
        .map_err(|e| ComponentFailure::new(Stage::Source, e))?;

    match source {
        ComponentSource::Template(template) => {
            let target = reconciler::apply(ctx, bundle, group, component, template, wave).await?;
            Ok(ComponentStatus::deployed(
                &component.name,
                RESOURCE_DEPLOYED_MESSAGE,
                target,
            ))
        }
        ComponentSource::Package(package) => {
            let target = reconcile_packaged(ctx, bundle, group, component, package, wave).await?;
            Ok(ComponentStatus::deployed(
                &component.name,
                PACKAGE_DEPLOYED_MESSAGE,
                target,
            ))
        }
    }
}

/// Deploy every group in order, stopping at the first failed component
///
/// Each pass starts from the first group and re-applies components that
/// are already deployed.
#[instrument(skip(ctx, bundle), fields(bundle = %bundle.name_any()))]
pub async fn run_pass(ctx: &Context, bundle: &AppBundle) -> PassOutcome {
    let mut outcome = PassOutcome::default();

    for (group, components) in plan(&bundle.spec.groups) {
        info!(group = %group.name, order = group.order, "deploying group");
        let mut statuses = Vec::with_capacity(components.len());

        for component in components {
            match deploy_component(ctx, bundle, group, component).await {
                Ok(status) => statuses.push(status),
                Err(failure) => {
                    error!(
                        group = %group.name,
                        component = %component.name,
                        error = %failure.error,
                        "component failed, aborting pass"
                    );
                    statuses.push(failure.status(&component.name));
                    outcome
                        .groups
                        .push(group_failed(&group.name, &component.name, &failure, statuses));
                    outcome.failure = Some((component.name.clone(), failure));
                    return outcome;
                }
            }
        }

        outcome.groups.push(group_deployed(&group.name, statuses));
    }

    outcome
}
