//! PackageVariant request construction

use kube::ResourceExt;
use serde_json::json;

use appbundle_common::crd::{AppBundle, Component, Group, PorchPackageRef, ResourceRef};
use appbundle_common::kube_utils::deterministic_hash;
use appbundle_common::manifest::Manifest;
use appbundle_common::{Error, SYNC_WAVE_ANNOTATION};

use super::gate::{build_gate_script, Gate, GateConfig};
use crate::orchestrator::gate_wave;
use crate::reconciler::{stamp, tracking_labels};

/// API version of PackageVariant
pub const PACKAGE_VARIANT_API_VERSION: &str = "config.porch.kpt.dev/v1alpha1";

/// Kind of PackageVariant
pub const PACKAGE_VARIANT_KIND: &str = "PackageVariant";

/// Mutator stamping the sync-wave annotation on rendered resources
pub const SET_ANNOTATIONS_IMAGE: &str = "gcr.io/kpt-fn/set-annotations:v0.1.4";

/// Mutator stamping the tracking labels on rendered resources
pub const SET_LABELS_IMAGE: &str = "gcr.io/kpt-fn/set-labels:v0.2.0";

/// Mutator running the wait-gate script
pub const STARLARK_IMAGE: &str = "gcr.io/kpt-fn/starlark:v0.5.0";

/// Longest valid DNS-1123 label
pub const MAX_NAME_LENGTH: usize = 63;

/// Coerce `raw` into a DNS-1123 label
///
/// Lowercases, replaces invalid characters with `-` and trims dashes at
/// either end. Names longer than [`MAX_NAME_LENGTH`] are truncated and
/// suffixed with a hash of the full name so distinct inputs stay distinct.
pub fn dns1123_label(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && label.ends_with('-') {
            continue;
        }
        label.push(c);
    }
    let label = label.trim_matches('-').to_string();

    if label.len() <= MAX_NAME_LENGTH {
        return label;
    }

    let hash = deterministic_hash(&label);
    let keep = MAX_NAME_LENGTH - hash.len() - 1;
    format!("{}-{}", label[..keep].trim_end_matches('-'), hash)
}

/// Deterministic PackageVariant name for a component
pub fn package_variant_name(bundle: &str, group: &str, component: &str) -> String {
    dns1123_label(&format!("{bundle}-{group}-{component}"))
}

/// Reference to a component's PackageVariant
pub fn package_variant_ref(bundle: &AppBundle, group: &Group, component: &Component, package: &PorchPackageRef) -> ResourceRef {
    let bundle_ns = bundle.namespace().unwrap_or_default();
    ResourceRef::new(
        PACKAGE_VARIANT_API_VERSION,
        PACKAGE_VARIANT_KIND,
        package_variant_name(&bundle.name_any(), &group.name, &component.name),
        Some(package.namespace_or(&bundle_ns).to_string()),
    )
}

/// Build the PackageVariant for a packaged component
///
/// The pipeline stamps the sync wave and tracking labels on every rendered
/// resource, then appends the wait gate.
pub fn build_package_variant(
    bundle: &AppBundle,
    group: &Group,
    component: &Component,
    package: &PorchPackageRef,
    wave: i64,
    gate: &GateConfig,
) -> Result<Manifest, Error> {
    let bundle_name = bundle.name_any();
    let bundle_ns = bundle.namespace().unwrap_or_default();
    let target = package_variant_ref(bundle, group, component, package);
    let labels = tracking_labels(&bundle_name, &group.name, &component.name);
    let downstream_repo = bundle
        .spec
        .porch_integration
        .as_ref()
        .map(|p| p.downstream_repository().to_string())
        .ok_or_else(|| Error::package(&package.name, "porch integration is not configured"))?;

    let script = build_gate_script(&Gate {
        name: dns1123_label(&format!("{}-gate", target.name)),
        namespace: bundle_ns.clone(),
        wave: gate_wave(group.order),
        image: gate.image.clone(),
        timeout: gate.timeout,
        fallback_sleep: gate.fallback_sleep,
        labels: labels.clone(),
    })?;

    let value = json!({
        "apiVersion": PACKAGE_VARIANT_API_VERSION,
        "kind": PACKAGE_VARIANT_KIND,
        "metadata": {
            "name": target.name,
            "namespace": target.namespace,
        },
        "spec": {
            "upstream": {
                "repo": package.upstream_repository(),
                "package": package.name,
                "revision": package.revision(),
            },
            "downstream": {
                "repo": downstream_repo,
                "package": target.name,
            },
            "adoptionPolicy": "adoptExisting",
            "deletionPolicy": "delete",
            "injectors": [
                {"name": "namespace", "namespace": {"name": bundle_ns}}
            ],
            "pipeline": {
                "mutators": [
                    {
                        "name": "set-sync-wave",
                        "image": SET_ANNOTATIONS_IMAGE,
                        "configMap": {SYNC_WAVE_ANNOTATION: wave.to_string()},
                    },
                    {
                        "name": "set-tracking-labels",
                        "image": SET_LABELS_IMAGE,
                        "configMap": labels,
                    },
                    {
                        "name": "wait-gate",
                        "image": STARLARK_IMAGE,
                        "configMap": {"source": script},
                    }
                ]
            }
        }
    });

    let mut manifest = Manifest::from_value(&target.name, value)?;
    stamp(&mut manifest, &bundle_name, &group.name, &component.name, wave);
    Ok(manifest)
}
