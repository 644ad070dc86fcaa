//! Applies a literal component manifest and waits for it

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument};

use appbundle_common::crd::{AppBundle, Component, Group, ResourceRef};
use appbundle_common::manifest::Manifest;
use appbundle_common::{
    Error, BUNDLE_LABEL_KEY, COMPONENT_LABEL_KEY, GROUP_LABEL_KEY, SYNC_WAVE_ANNOTATION,
};

use crate::client::ResourceScope;
use crate::controller::Context;
use crate::readiness::wait_ready;
use crate::status::{ComponentFailure, Stage};

/// Labels tying a resource back to its bundle, group and component
pub fn tracking_labels(bundle: &str, group: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (BUNDLE_LABEL_KEY.to_string(), bundle.to_string()),
        (GROUP_LABEL_KEY.to_string(), group.to_string()),
        (COMPONENT_LABEL_KEY.to_string(), component.to_string()),
    ])
}

/// Stamp the sync-wave annotation and tracking labels
pub fn stamp(manifest: &mut Manifest, bundle: &str, group: &str, component: &str, wave: i64) {
    manifest.set_annotation(SYNC_WAVE_ANNOTATION, wave.to_string());
    for (key, value) in tracking_labels(bundle, group, component) {
        manifest.set_label(&key, value);
    }
}

/// Add `owner` to the manifest's owner references, replacing any entry with the same uid
fn set_owner(manifest: &mut Manifest, owner: &OwnerReference) -> Result<(), Error> {
    let mut refs: Vec<Value> = manifest
        .owner_references()
        .iter()
        .filter(|r| r.get("uid").and_then(Value::as_str) != Some(owner.uid.as_str()))
        .cloned()
        .collect();
    refs.push(serde_json::to_value(owner)?);
    manifest.set_owner_references(Value::Array(refs));
    Ok(())
}

/// Reference to the live object, without a namespace for cluster-scoped kinds
pub fn target_ref(manifest: &Manifest, scope: ResourceScope) -> ResourceRef {
    let mut target = manifest.resource_ref();
    if scope == ResourceScope::Cluster {
        target.namespace = None;
    }
    target
}

/// Apply a component's literal manifest, then block until it is ready
///
/// Creates the object when absent and replaces it (carrying the live
/// resourceVersion) when present.
#[instrument(
    skip(ctx, bundle, group, component, template),
    fields(bundle = %bundle.name_any(), group = %group.name, component = %component.name)
)]
pub async fn apply(
    ctx: &Context,
    bundle: &AppBundle,
    group: &Group,
    component: &Component,
    template: &Value,
    wave: i64,
) -> Result<ResourceRef, ComponentFailure> {
    let bundle_name = bundle.name_any();
    let bundle_ns = bundle.namespace().unwrap_or_default();

    let mut manifest = Manifest::from_template(&component.name, template)
        .map_err(|e| ComponentFailure::new(Stage::Parse, e))?;
    stamp(&mut manifest, &bundle_name, &group.name, &component.name, wave);

    let scope = ctx
        .cluster
        .scope(manifest.api_version(), manifest.kind())
        .await
        .map_err(|e| ComponentFailure::new(Stage::Lookup, e).on(manifest.resource_ref()))?;

    if scope == ResourceScope::Namespaced {
        manifest.default_namespace(&bundle_ns);
    }

    match bundle.controller_owner_ref(&()) {
        Some(owner) if scope == ResourceScope::Namespaced && manifest.namespace() == Some(bundle_ns.as_str()) => {
            set_owner(&mut manifest, &owner)
                .map_err(|e| ComponentFailure::new(Stage::Parse, e))?;
        }
        _ => {
            debug!(
                kind = manifest.kind(),
                name = manifest.name(),
                namespace = manifest.namespace().unwrap_or_default(),
                bundle_namespace = %bundle_ns,
                "skipping owner reference for cross-namespace or cluster-scoped resource"
            );
        }
    }

    let target = target_ref(&manifest, scope);
    let fail = |stage: Stage| {
        let target = target.clone();
        move |e: Error| ComponentFailure::new(stage, e).on(target)
    };

    match ctx.cluster.get(&target).await.map_err(fail(Stage::Lookup))? {
        None => {
            info!(kind = %target.kind, name = %target.name, "creating resource");
            ctx.cluster
                .create(&manifest)
                .await
                .map_err(fail(Stage::Create))?;
        }
        Some(existing) => {
            info!(kind = %target.kind, name = %target.name, "updating resource");
            if let Some(version) = existing.resource_version() {
                manifest.set_resource_version(version);
            }
            ctx.cluster
                .replace(&manifest)
                .await
                .map_err(fail(Stage::Update))?;
        }
    }

    wait_ready(
        ctx.cluster.as_ref(),
        &target,
        &ctx.config.readiness(),
        &ctx.cancel,
    )
    .await
    .map_err(fail(Stage::Ready))?;

    Ok(target)
}
