//! AppBundle controller: reconcile entry point, shared context and error policy
//!
//! Each reconcile either cleans up a deleting bundle or runs one full
//! deployment pass and writes the result to the status subresource. The
//! engine's own status writes come back as watch events, so the last pass
//! per bundle is remembered and a fresh pass for the same generation is
//! held off until the resync interval (or the retry backoff) has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use appbundle_common::crd::AppBundle;
use appbundle_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use appbundle_common::kube_utils::{DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT};
use appbundle_common::{Error, FIELD_MANAGER};

use crate::client::{BundleClient, ClusterClient, KubeBundleClient, KubeClusterClient};
use crate::finalizer::finalize;
use crate::orchestrator::run_pass;
use crate::package::GateConfig;
use crate::readiness::ReadinessPolicy;
use crate::status::{deploying_status, invalid_status, pending_status, terminal_status};

/// Default interval between passes over a Deployed bundle
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue delay after a retryable failure
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Operator-level settings shared by every reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Delay between readiness checks
    pub poll_interval: Duration,
    /// Upper bound on a single readiness wait
    pub readiness_timeout: Duration,
    /// Interval between passes over a bundle that is already deployed
    pub resync_interval: Duration,
    /// Requeue delay after a retryable failure
    pub retry_backoff: Duration,
    /// Wait-gate settings for packaged components
    pub gate: GateConfig,
    /// Field manager for writes to the AppBundle
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            gate: GateConfig::default(),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Readiness policy for every wait in a pass
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            poll_interval: self.poll_interval,
            timeout: self.readiness_timeout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassResult {
    Succeeded,
    Failed { retryable: bool },
}

impl PassResult {
    fn from_error(error: &Error) -> Self {
        Self::Failed {
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PassRecord {
    generation: Option<i64>,
    finished: Instant,
    result: PassResult,
}

/// Last pass per bundle, keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct PassTracker {
    records: Mutex<HashMap<String, PassRecord>>,
}

impl PassTracker {
    fn record(&self, key: &str, generation: Option<i64>, result: PassResult) {
        let record = PassRecord {
            generation,
            finished: Instant::now(),
            result,
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), record);
    }

    fn forget(&self, key: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Action to return instead of running a pass, if the last one is still fresh
    ///
    /// A generation change always runs a new pass.
    fn hold_off(&self, key: &str, generation: Option<i64>, config: &ControllerConfig) -> Option<Action> {
        let record = *self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)?;
        if record.generation != generation {
            return None;
        }

        let elapsed = record.finished.elapsed();
        match record.result {
            PassResult::Failed { retryable: false } => Some(Action::await_change()),
            PassResult::Failed { retryable: true } => config
                .retry_backoff
                .checked_sub(elapsed)
                .filter(|left| !left.is_zero())
                .map(Action::requeue),
            PassResult::Succeeded => config
                .resync_interval
                .checked_sub(elapsed)
                .filter(|left| !left.is_zero())
                .map(Action::requeue),
        }
    }
}

/// Shared controller context
pub struct Context {
    /// Access to the resources bundles deploy
    pub cluster: Arc<dyn ClusterClient>,
    /// Writes to the AppBundle itself
    pub bundles: Arc<dyn BundleClient>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Operator settings
    pub config: ControllerConfig,
    /// Cancelled on shutdown; aborts every readiness wait
    pub cancel: CancellationToken,
    passes: PassTracker,
}

impl Context {
    /// Create a context from explicit collaborators
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        bundles: Arc<dyn BundleClient>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            bundles,
            events,
            config,
            cancel,
            passes: PassTracker::default(),
        }
    }

    /// Create a context backed by a live cluster
    pub fn from_client(client: Client, config: ControllerConfig, cancel: CancellationToken) -> Self {
        let bundles = KubeBundleClient::new(client.clone(), config.field_manager.clone());
        let events = KubeEventPublisher::new(client.clone(), &config.field_manager);
        Self::new(
            Arc::new(KubeClusterClient::new(client)),
            Arc::new(bundles),
            Arc::new(events),
            config,
            cancel,
        )
    }
}

async fn cleanup(bundle: &AppBundle, ctx: &Context, key: &str, namespace: &str) -> Result<Action, Error> {
    let name = bundle.name_any();
    let object_ref = bundle.object_ref(&());
    ctx.passes.forget(key);

    info!("bundle is being deleted, cleaning up resources");
    ctx.events
        .publish(&object_ref, EventType::Normal, reasons::CLEANUP_STARTED, actions::DELETE, None)
        .await;

    let summary = finalize(ctx, bundle).await;
    ctx.bundles.remove_finalizer(&name, namespace).await?;

    info!(
        deleted = summary.deleted,
        missing = summary.missing,
        skipped = summary.skipped,
        "cleanup complete, finalizer removed"
    );
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::CLEANUP_COMPLETE,
            actions::DELETE,
            Some(format!(
                "Deleted {} resources ({} already gone, {} skipped)",
                summary.deleted, summary.missing, summary.skipped
            )),
        )
        .await;
    Ok(Action::await_change())
}

/// Reconcile one AppBundle
#[instrument(
    skip(bundle, ctx),
    fields(bundle = %bundle.name_any(), namespace = %bundle.namespace().unwrap_or_default())
)]
pub async fn reconcile(bundle: Arc<AppBundle>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = bundle.name_any();
    let namespace = bundle
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AppBundle must be namespaced"))?;
    let key = format!("{namespace}/{name}");

    if bundle.is_deleting() {
        if !bundle.has_finalizer() {
            return Ok(Action::await_change());
        }
        return cleanup(&bundle, &ctx, &key, &namespace).await;
    }

    if !bundle.has_finalizer() {
        debug!("adding finalizer");
        ctx.bundles.add_finalizer(&name, &namespace).await?;
    }

    if bundle.status.is_none() {
        ctx.bundles
            .patch_status(&name, &namespace, &pending_status())
            .await?;
    }

    let generation = bundle.metadata.generation;
    if let Some(action) = ctx.passes.hold_off(&key, generation, &ctx.config) {
        debug!(?generation, "pass for this generation is still fresh");
        return Ok(action);
    }

    let object_ref = bundle.object_ref(&());
    if let Err(e) = bundle.spec.validate(&name) {
        warn!(error = %e, "bundle spec is invalid");
        ctx.bundles
            .patch_status(&name, &namespace, &invalid_status(&bundle, &e))
            .await?;
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::DEPLOY,
                Some(e.to_string()),
            )
            .await;
        ctx.passes.record(&key, generation, PassResult::from_error(&e));
        return Err(e);
    }

    info!(?generation, groups = bundle.spec.groups.len(), "starting deployment pass");
    ctx.events
        .publish(&object_ref, EventType::Normal, reasons::DEPLOYMENT_STARTED, actions::DEPLOY, None)
        .await;
    let deploying = deploying_status(&bundle);
    ctx.bundles
        .patch_status(&name, &namespace, &deploying)
        .await?;

    let outcome = run_pass(&ctx, &bundle).await;
    if let Some((_, failure)) = &outcome.failure {
        if matches!(failure.error, Error::Cancelled { .. }) {
            info!("pass cancelled by shutdown");
            return Err(Error::cancelled(format!("pass for {key}")));
        }
    }

    ctx.bundles
        .patch_status(&name, &namespace, &terminal_status(&bundle, &deploying, &outcome))
        .await?;

    match outcome.failure {
        None => {
            info!("bundle deployed");
            ctx.passes.record(&key, generation, PassResult::Succeeded);
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Normal,
                    reasons::DEPLOYMENT_COMPLETE,
                    actions::DEPLOY,
                    None,
                )
                .await;
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Some((component, failure)) => {
            ctx.passes
                .record(&key, generation, PassResult::from_error(&failure.error));
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Warning,
                    reasons::DEPLOYMENT_FAILED,
                    actions::DEPLOY,
                    Some(format!("component {component}: {}", failure.message())),
                )
                .await;
            Err(failure.error)
        }
    }
}

/// Requeue retryable failures after the backoff, otherwise wait for a spec change
pub fn error_policy(bundle: Arc<AppBundle>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            bundle = %bundle.name_any(),
            error = %error,
            backoff_secs = ctx.config.retry_backoff.as_secs(),
            "reconcile failed, will retry"
        );
        Action::requeue(ctx.config.retry_backoff)
    } else {
        error!(
            bundle = %bundle.name_any(),
            error = %error,
            "reconcile failed, waiting for spec change"
        );
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockBundleClient, MockClusterClient, ResourceScope};
    use crate::testing::{bundle_with_groups, component, group};
    use appbundle_common::crd::{AppBundleStatus, DeploymentPhase};
    use appbundle_common::events::NoopEventPublisher;
    use appbundle_common::manifest::Manifest;
    use appbundle_common::{APPBUNDLE_FINALIZER, SYNC_WAVE_ANNOTATION};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    type StatusLog = Arc<Mutex<Vec<AppBundleStatus>>>;

    fn recording_bundles(log: StatusLog) -> MockBundleClient {
        let mut bundles = MockBundleClient::new();
        bundles.expect_patch_status().returning(move |_, _, status| {
            log.lock().unwrap().push(status.clone());
            Ok(())
        });
        bundles
    }

    fn ctx_with(cluster: MockClusterClient, bundles: MockBundleClient) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(cluster),
            Arc::new(bundles),
            Arc::new(NoopEventPublisher),
            ControllerConfig::default(),
            CancellationToken::new(),
        ))
    }

    fn finalized(mut bundle: AppBundle) -> AppBundle {
        bundle.metadata.finalizers = Some(vec![APPBUNDLE_FINALIZER.to_string()]);
        bundle
    }

    fn phases(log: &StatusLog) -> Vec<DeploymentPhase> {
        log.lock().unwrap().iter().map(|s| s.phase).collect()
    }

    /// Cluster where created objects exist and Deployments are fully rolled out
    fn live_cluster(created: Arc<Mutex<Vec<Manifest>>>) -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_scope()
            .returning(|_, kind| Ok(ResourceScope::from_kind(kind)));
        let reader = created.clone();
        cluster.expect_get().returning(move |target| {
            Ok(reader
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.kind() == target.kind && m.name() == target.name)
                .map(|m| {
                    let mut v = m.to_value();
                    v["status"] =
                        json!({"readyReplicas": 1, "updatedReplicas": 1, "availableReplicas": 1});
                    Manifest::from_value("live", v).unwrap()
                }))
        });
        cluster.expect_create().returning(move |m| {
            created.lock().unwrap().push(m.clone());
            Ok(m.clone())
        });
        cluster.expect_replace().returning(|m| Ok(m.clone()));
        cluster
    }

    fn two_tier_bundle() -> AppBundle {
        finalized(bundle_with_groups(vec![
            group(
                "infra",
                0,
                vec![component(
                    "ns",
                    0,
                    json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "shop"}}),
                )],
            ),
            group(
                "app",
                1,
                vec![component(
                    "web",
                    0,
                    json!({
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "metadata": {"name": "web"},
                        "spec": {"replicas": 1}
                    }),
                )],
            ),
        ]))
    }

    #[tokio::test]
    async fn fresh_bundle_goes_pending_deploying_deployed() {
        let created: Arc<Mutex<Vec<Manifest>>> = Arc::default();
        let log: StatusLog = Arc::default();
        let ctx = ctx_with(live_cluster(created.clone()), recording_bundles(log.clone()));

        let action = reconcile(Arc::new(two_tier_bundle()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));
        assert_eq!(
            phases(&log),
            vec![
                DeploymentPhase::Pending,
                DeploymentPhase::Deploying,
                DeploymentPhase::Deployed
            ]
        );

        let waves: Vec<String> = created
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.annotation(SYNC_WAVE_ANNOTATION).unwrap_or_default().to_string())
            .collect();
        assert_eq!(waves, vec!["0", "100"]);

        let last = log.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.observed_generation, Some(1));
        assert_eq!(last.group_statuses.len(), 2);
        let ready = last.get_condition("Ready").unwrap();
        assert_eq!(ready.reason, "DeploymentComplete");
    }

    #[tokio::test]
    async fn invalid_manifest_fails_bundle_without_touching_later_groups() {
        let created: Arc<Mutex<Vec<Manifest>>> = Arc::default();
        let log: StatusLog = Arc::default();
        let ctx = ctx_with(live_cluster(created.clone()), recording_bundles(log.clone()));

        let mut bundle = two_tier_bundle();
        bundle.spec.groups[0].components[0].template =
            Some(json!({"kind": "Namespace", "metadata": {"name": "shop"}}));

        let err = reconcile(Arc::new(bundle), ctx).await.unwrap_err();
        assert!(matches!(err, Error::ManifestParse { .. }));
        assert!(created.lock().unwrap().is_empty());

        let last = log.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, DeploymentPhase::Failed);
        assert_eq!(last.message.as_deref(), Some(err.to_string().as_str()));
        assert_eq!(last.group_statuses.len(), 1);
        assert_eq!(last.group_statuses[0].phase, DeploymentPhase::Failed);
        assert!(last.group_statuses[0]
            .message
            .as_deref()
            .unwrap()
            .starts_with("Failed to deploy component ns: "));
        assert!(last.group_statuses[0].component_statuses[0]
            .message
            .as_deref()
            .unwrap()
            .starts_with("Failed to parse template: "));
    }

    #[tokio::test(start_paused = true)]
    async fn job_that_never_completes_times_out() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_scope()
            .returning(|_, _| Ok(ResourceScope::Namespaced));
        let exists = Arc::new(Mutex::new(false));
        let probe = exists.clone();
        cluster.expect_get().returning(move |_| {
            if !*probe.lock().unwrap() {
                return Ok(None);
            }
            Ok(Some(
                Manifest::from_value(
                    "migrate",
                    json!({
                        "apiVersion": "batch/v1",
                        "kind": "Job",
                        "metadata": {"name": "migrate", "namespace": "shop"},
                        "status": {"active": 1}
                    }),
                )
                .unwrap(),
            ))
        });
        cluster.expect_create().returning(move |m| {
            *exists.lock().unwrap() = true;
            Ok(m.clone())
        });

        let log: StatusLog = Arc::default();
        let ctx = ctx_with(cluster, recording_bundles(log.clone()));
        let bundle = finalized(bundle_with_groups(vec![group(
            "data",
            0,
            vec![component(
                "migrate",
                0,
                json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "migrate"}}),
            )],
        )]));
        let bundle = Arc::new(bundle);

        let started = Instant::now();
        let err = reconcile(bundle.clone(), ctx.clone()).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
        assert_eq!(error_policy(bundle.clone(), &err, ctx.clone()), Action::requeue(DEFAULT_RETRY_BACKOFF));

        let last = log.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, DeploymentPhase::Failed);
        let component = &last.group_statuses[0].component_statuses[0];
        assert!(component
            .message
            .as_deref()
            .unwrap()
            .starts_with("Resource not ready: timed out after 300s"));

        // The status write above re-triggers a reconcile; it must not start another pass
        let writes = log.lock().unwrap().len();
        let mut deployed = (*bundle).clone();
        deployed.status = Some(last);
        let action = reconcile(Arc::new(deployed), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RETRY_BACKOFF));
        assert_eq!(log.lock().unwrap().len(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn own_status_write_does_not_start_a_new_pass() {
        let created: Arc<Mutex<Vec<Manifest>>> = Arc::default();
        let log: StatusLog = Arc::default();
        let ctx = ctx_with(live_cluster(created.clone()), recording_bundles(log.clone()));
        let config_only = finalized(bundle_with_groups(vec![group(
            "config",
            0,
            vec![component(
                "settings",
                0,
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "settings"}}),
            )],
        )]));

        reconcile(Arc::new(config_only.clone()), ctx.clone()).await.unwrap();
        let writes = log.lock().unwrap().len();

        let mut observed = config_only.clone();
        observed.status = log.lock().unwrap().last().cloned();
        let action = reconcile(Arc::new(observed.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));
        assert_eq!(log.lock().unwrap().len(), writes);
        assert_eq!(created.lock().unwrap().len(), 1);

        // A spec change runs a new pass right away
        observed.metadata.generation = Some(2);
        reconcile(Arc::new(observed.clone()), ctx.clone()).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), writes + 2);

        // Past the resync interval the same generation runs again
        tokio::time::advance(DEFAULT_RESYNC_INTERVAL).await;
        reconcile(Arc::new(observed), ctx).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), writes + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unserved_kind_is_retried_after_backoff() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_scope()
            .returning(|_, _| Ok(ResourceScope::Namespaced));
        cluster.expect_get().returning(|_| Ok(None));
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        cluster.expect_create().returning(move |_| {
            *counter.lock().unwrap() += 1;
            Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the server could not find the requested resource".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })))
        });

        let log: StatusLog = Arc::default();
        let ctx = ctx_with(cluster, recording_bundles(log.clone()));
        let bundle = Arc::new(finalized(bundle_with_groups(vec![group(
            "app",
            0,
            vec![component(
                "cache",
                0,
                json!({"apiVersion": "cache.example.com/v1", "kind": "Redis", "metadata": {"name": "cache"}}),
            )],
        )])));

        let err = reconcile(bundle.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            error_policy(bundle.clone(), &err, ctx.clone()),
            Action::requeue(DEFAULT_RETRY_BACKOFF)
        );
        assert_eq!(log.lock().unwrap().last().unwrap().phase, DeploymentPhase::Failed);

        // Same generation inside the backoff is held off, not awaited forever
        let action = reconcile(bundle.clone(), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RETRY_BACKOFF));
        assert_eq!(*attempts.lock().unwrap(), 1);

        tokio::time::advance(DEFAULT_RETRY_BACKOFF).await;
        reconcile(bundle, ctx).await.unwrap_err();
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_finalizer_is_added() {
        let mut bundles = recording_bundles(Arc::default());
        bundles
            .expect_add_finalizer()
            .withf(|name, ns| name == "shop" && ns == "shop")
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = ctx_with(live_cluster(Arc::default()), bundles);

        let bundle = bundle_with_groups(vec![group(
            "config",
            0,
            vec![component(
                "settings",
                0,
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "settings"}}),
            )],
        )]);
        reconcile(Arc::new(bundle), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_spec_waits_for_change() {
        let log: StatusLog = Arc::default();
        let ctx = ctx_with(MockClusterClient::new(), recording_bundles(log.clone()));
        let mut bundle = two_tier_bundle();
        bundle.spec.groups[1].name = "infra".to_string();
        let bundle = Arc::new(bundle);

        let err = reconcile(bundle.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(error_policy(bundle, &err, ctx), Action::await_change());
        assert_eq!(
            phases(&log),
            vec![DeploymentPhase::Pending, DeploymentPhase::Failed]
        );
    }

    #[tokio::test]
    async fn deletion_cleans_up_and_removes_finalizer() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_scope()
            .returning(|_, kind| Ok(ResourceScope::from_kind(kind)));
        cluster.expect_delete().times(2).returning(|_| Ok(true));

        let mut bundles = MockBundleClient::new();
        bundles.expect_patch_status().never();
        bundles
            .expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = ctx_with(cluster, bundles);

        let mut bundle = two_tier_bundle();
        bundle.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = reconcile(Arc::new(bundle), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_a_no_op() {
        let ctx = ctx_with(MockClusterClient::new(), MockBundleClient::new());
        let mut bundle = bundle_with_groups(vec![]);
        bundle.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = reconcile(Arc::new(bundle), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn shutdown_skips_the_terminal_write() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_scope()
            .returning(|_, _| Ok(ResourceScope::Namespaced));
        cluster.expect_get().returning(|_| Ok(None));
        cluster.expect_create().returning(|m| Ok(m.clone()));

        let log: StatusLog = Arc::default();
        let ctx = ctx_with(cluster, recording_bundles(log.clone()));
        ctx.cancel.cancel();

        let err = reconcile(Arc::new(two_tier_bundle()), ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(
            phases(&log),
            vec![DeploymentPhase::Pending, DeploymentPhase::Deploying]
        );
    }
}
