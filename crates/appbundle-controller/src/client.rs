//! Cluster access for the reconciliation engine
//!
//! Two seams keep the engine testable without an API server:
//! [`ClusterClient`] is capability-typed access to arbitrary resources, and
//! [`BundleClient`] covers the writes the engine makes to the AppBundle
//! itself (status and finalizer).

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::{ApiResource, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use appbundle_common::crd::{AppBundle, AppBundleStatus, ResourceRef};
use appbundle_common::kube_utils::{build_api_resource, is_cluster_scoped_kind, parse_api_version};
use appbundle_common::manifest::Manifest;
use appbundle_common::{Error, APPBUNDLE_FINALIZER};

/// Whether a kind lives inside a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceScope {
    /// Namespaced kind
    Namespaced,
    /// Cluster-scoped kind
    Cluster,
}

impl ResourceScope {
    /// Best guess from the kind alone, for kinds discovery cannot resolve
    pub fn from_kind(kind: &str) -> Self {
        if is_cluster_scoped_kind(kind) {
            Self::Cluster
        } else {
            Self::Namespaced
        }
    }
}

/// Generic resource access used by the engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Scope of the given kind
    async fn scope(&self, api_version: &str, kind: &str) -> Result<ResourceScope, Error>;

    /// Fetch a resource, `None` if it does not exist
    async fn get(&self, target: &ResourceRef) -> Result<Option<Manifest>, Error>;

    /// Create a resource
    async fn create(&self, manifest: &Manifest) -> Result<Manifest, Error>;

    /// Replace a resource; the manifest must carry the current resourceVersion
    async fn replace(&self, manifest: &Manifest) -> Result<Manifest, Error>;

    /// Delete a resource, returning false if it was already gone
    async fn delete(&self, target: &ResourceRef) -> Result<bool, Error>;

    /// List resources of a kind in a namespace
    async fn list(&self, api_version: &str, kind: &str, namespace: &str)
        -> Result<Vec<Manifest>, Error>;
}

/// Writes to the AppBundle resource itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleClient: Send + Sync {
    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AppBundleStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// [`ClusterClient`] backed by kube-rs dynamic objects
///
/// Kinds are resolved through API discovery and cached; kinds discovery
/// cannot find fall back to a plural guess and the built-in scope table.
pub struct KubeClusterClient {
    client: Client,
    resolved: RwLock<HashMap<String, (ApiResource, ResourceScope)>>,
}

impl KubeClusterClient {
    /// Create a client wrapper
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> (ApiResource, ResourceScope) {
        let key = format!("{api_version}/{kind}");
        if let Some(hit) = self.resolved.read().await.get(&key) {
            return hit.clone();
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((ar, caps)) => {
                let scope = match caps.scope {
                    Scope::Cluster => ResourceScope::Cluster,
                    Scope::Namespaced => ResourceScope::Namespaced,
                };
                self.resolved.write().await.insert(key, (ar.clone(), scope));
                (ar, scope)
            }
            Err(e) => {
                debug!(api_version, kind, error = %e, "discovery failed, guessing resource");
                (build_api_resource(api_version, kind), ResourceScope::from_kind(kind))
            }
        }
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let (ar, scope) = self.resolve(api_version, kind).await;
        match (scope, namespace) {
            (ResourceScope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (ResourceScope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (ResourceScope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn to_dynamic(manifest: &Manifest) -> Result<DynamicObject, Error> {
    serde_json::from_value(manifest.to_value())
        .map_err(|e| Error::serialization_for_kind(manifest.kind(), e.to_string()))
}

fn from_dynamic(obj: DynamicObject) -> Result<Manifest, Error> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    Manifest::from_value(&name, serde_json::to_value(obj)?)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn scope(&self, api_version: &str, kind: &str) -> Result<ResourceScope, Error> {
        Ok(self.resolve(api_version, kind).await.1)
    }

    async fn get(&self, target: &ResourceRef) -> Result<Option<Manifest>, Error> {
        let api = self
            .api(&target.api_version, &target.kind, target.namespace.as_deref())
            .await;
        match api.get_opt(&target.name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, manifest: &Manifest) -> Result<Manifest, Error> {
        let api = self
            .api(manifest.api_version(), manifest.kind(), manifest.namespace())
            .await;
        let created = api.create(&PostParams::default(), &to_dynamic(manifest)?).await?;
        from_dynamic(created)
    }

    async fn replace(&self, manifest: &Manifest) -> Result<Manifest, Error> {
        let api = self
            .api(manifest.api_version(), manifest.kind(), manifest.namespace())
            .await;
        let replaced = api
            .replace(manifest.name(), &PostParams::default(), &to_dynamic(manifest)?)
            .await?;
        from_dynamic(replaced)
    }

    async fn delete(&self, target: &ResourceRef) -> Result<bool, Error> {
        let api = self
            .api(&target.api_version, &target.kind, target.namespace.as_deref())
            .await;
        match api.delete(&target.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<Manifest>, Error> {
        let api = self.api(api_version, kind, Some(namespace)).await;
        let list = api.list(&ListParams::default()).await?;
        list.items.into_iter().map(from_dynamic).collect()
    }
}

/// [`BundleClient`] backed by the typed AppBundle API
pub struct KubeBundleClient {
    client: Client,
    field_manager: String,
}

impl KubeBundleClient {
    /// Create a client wrapper writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    async fn patch_finalizers(&self, name: &str, namespace: &str, finalizers: Vec<String>) -> Result<(), Error> {
        let api: Api<AppBundle> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BundleClient for KubeBundleClient {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AppBundleStatus,
    ) -> Result<(), Error> {
        let api: Api<AppBundle> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<AppBundle> = Api::namespaced(self.client.clone(), namespace);
        let bundle = api.get(name).await?;
        let mut finalizers = bundle.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == APPBUNDLE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(APPBUNDLE_FINALIZER.to_string());
        self.patch_finalizers(name, namespace, finalizers).await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<AppBundle> = Api::namespaced(self.client.clone(), namespace);
        let bundle = match api.get_opt(name).await? {
            Some(bundle) => bundle,
            None => return Ok(()),
        };
        let finalizers: Vec<String> = bundle
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != APPBUNDLE_FINALIZER)
            .collect();
        self.patch_finalizers(name, namespace, finalizers).await
    }
}
