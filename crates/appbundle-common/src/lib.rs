//! Common types for AppBundle: CRDs, errors, manifests and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod manifest;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer token that gates AppBundle deletion until cleanup has run
pub const APPBUNDLE_FINALIZER: &str = "app.example.com/finalizer";

/// Label carrying the owning AppBundle name
pub const BUNDLE_LABEL_KEY: &str = "app.example.com/appbundle";

/// Label carrying the group name within the bundle
pub const GROUP_LABEL_KEY: &str = "app.example.com/group";

/// Label carrying the component name within the group
pub const COMPONENT_LABEL_KEY: &str = "app.example.com/component";

/// Argo CD sync-wave annotation read by the GitOps sync engine
pub const SYNC_WAVE_ANNOTATION: &str = "argocd.argoproj.io/sync-wave";

/// Argo CD hook annotation
pub const HOOK_ANNOTATION: &str = "argocd.argoproj.io/hook";

/// Argo CD hook delete policy annotation
pub const HOOK_DELETE_POLICY_ANNOTATION: &str = "argocd.argoproj.io/hook-delete-policy";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "appbundle-controller";

/// Number of wave slots reserved per group
///
/// Waves only stay ordered across groups while every group has fewer
/// components than this.
pub const WAVES_PER_GROUP: i64 = 100;
