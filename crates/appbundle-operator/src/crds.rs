//! CRD installation on startup using server-side apply

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use appbundle_common::crd::AppBundle;

/// Render the AppBundle CRD as YAML
pub fn appbundle_crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&AppBundle::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize AppBundle CRD: {e}"))
}

/// Install or update the AppBundle CRD
pub async fn ensure_appbundle_crd(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = AppBundle::crd();
    let name = AppBundle::crd_name();

    tracing::info!(crd = name, "installing AppBundle CRD");
    crds.patch(name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    tracing::info!(crd = name, "AppBundle CRD installed/updated");
    Ok(())
}
