//! Best-effort discovery of the resources Porch rendered for a PackageVariant
//!
//! Once a PackageVariant is ready, its downstream PackageRevisions hold the
//! rendered package. Workloads found there are waited on so the component
//! reports Deployed only after they roll out. Nothing here fails the
//! component: the PackageVariant being ready is what counts.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use appbundle_common::crd::ResourceRef;
use appbundle_common::manifest::Manifest;
use appbundle_common::yaml::parse_documents;
use appbundle_common::Error;

use super::gate::GATE_LABEL_KEY;
use crate::client::ResourceScope;
use crate::controller::Context;
use crate::readiness::wait_ready;

/// API version of Porch's aggregated resources
pub const PORCH_API_VERSION: &str = "porch.kpt.dev/v1alpha1";

/// Kind listing package revisions
pub const PACKAGE_REVISION_KIND: &str = "PackageRevision";

/// Kind holding a revision's files
pub const PACKAGE_REVISION_RESOURCES_KIND: &str = "PackageRevisionResources";

/// Annotation marking kpt function configs and other non-deployed objects
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";

/// Kinds that are never waited on
pub const INFRASTRUCTURE_KINDS: &[&str] = &[
    "Namespace",
    "ConfigMap",
    "Secret",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "ResourceQuota",
    "LimitRange",
];

/// Downstream revision names reported on the PackageVariant
pub fn downstream_targets(variant: &Manifest) -> Vec<String> {
    variant
        .slice_at(&["status", "downstreamTargets"])
        .unwrap_or_default()
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Returns true if a rendered object should be waited on
fn is_deployable(m: &Manifest) -> bool {
    m.kind() != "Kptfile"
        && m.annotation(LOCAL_CONFIG_ANNOTATION) != Some("true")
        && m.label(GATE_LABEL_KEY) != Some("true")
        && !INFRASTRUCTURE_KINDS.contains(&m.kind())
}

/// Parse a revision's files into the objects worth waiting on
///
/// Objects without a namespace get `default_namespace` unless their kind
/// is cluster-scoped. Unparseable files are skipped.
pub fn rendered_resources(files: &Map<String, Value>, default_namespace: &str) -> Vec<Manifest> {
    let mut resources = Vec::new();
    for (path, content) in files {
        let Some(text) = content.as_str() else {
            continue;
        };
        if path.ends_with("Kptfile") || !(path.ends_with(".yaml") || path.ends_with(".yml")) {
            continue;
        }
        let docs = match parse_documents(text) {
            Ok(docs) => docs,
            Err(e) => {
                debug!(path = %path, error = %e, "skipping unparseable package file");
                continue;
            }
        };
        for doc in docs {
            match Manifest::from_value(path, doc) {
                Ok(mut m) if is_deployable(&m) => {
                    if ResourceScope::from_kind(m.kind()) == ResourceScope::Namespaced {
                        m.default_namespace(default_namespace);
                    }
                    resources.push(m);
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path, error = %e, "skipping object in package file"),
            }
        }
    }
    resources
}

async fn revision_names(
    ctx: &Context,
    variant: &ResourceRef,
    downstream_repo: &str,
) -> Result<Vec<String>, Error> {
    if let Some(live) = ctx.cluster.get(variant).await? {
        let targets = downstream_targets(&live);
        if !targets.is_empty() {
            return Ok(targets);
        }
    }

    let namespace = variant.namespace.as_deref().unwrap_or_default();
    let revisions = ctx
        .cluster
        .list(PORCH_API_VERSION, PACKAGE_REVISION_KIND, namespace)
        .await?;
    Ok(revisions
        .iter()
        .filter(|r| {
            r.str_at(&["spec", "repository"]) == Some(downstream_repo)
                && r.str_at(&["spec", "packageName"]) == Some(variant.name.as_str())
        })
        .map(|r| r.name().to_string())
        .collect())
}

async fn discover(
    ctx: &Context,
    variant: &ResourceRef,
    downstream_repo: &str,
    target_namespace: &str,
) -> Result<Vec<Manifest>, Error> {
    let mut resources = Vec::new();
    for revision in revision_names(ctx, variant, downstream_repo).await? {
        let contents = ResourceRef::new(
            PORCH_API_VERSION,
            PACKAGE_REVISION_RESOURCES_KIND,
            &revision,
            variant.namespace.clone(),
        );
        let Some(contents) = ctx.cluster.get(&contents).await? else {
            debug!(revision = %revision, "package revision has no resources yet");
            continue;
        };
        if let Some(files) = contents.at(&["spec", "resources"]).and_then(Value::as_object) {
            resources.extend(rendered_resources(files, target_namespace));
        }
    }
    Ok(resources)
}

/// Wait for the workloads a PackageVariant rendered, logging any failure
pub async fn wait_for_rendered(
    ctx: &Context,
    variant: &ResourceRef,
    downstream_repo: &str,
    target_namespace: &str,
) {
    let resources = match discover(ctx, variant, downstream_repo, target_namespace).await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(package_variant = %variant.name, error = %e, "could not discover rendered resources");
            return;
        }
    };

    info!(
        package_variant = %variant.name,
        count = resources.len(),
        "waiting for rendered resources"
    );
    let policy = ctx.config.readiness();
    for resource in resources {
        let target = resource.resource_ref();
        if let Err(e) = wait_ready(ctx.cluster.as_ref(), &target, &policy, &ctx.cancel).await {
            warn!(
                package_variant = %variant.name,
                resource = %target,
                error = %e,
                "rendered resource not ready"
            );
        }
    }
}
