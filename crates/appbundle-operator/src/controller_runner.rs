//! Builds the AppBundle controller future

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use appbundle_common::crd::AppBundle;
use appbundle_controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Controller over every AppBundle in the cluster
///
/// Runs until the context's cancellation token fires, then lets in-flight
/// reconciles finish; their readiness waits observe the same token.
pub fn build_appbundle_controller(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> impl Future<Output = ()> + Send {
    let bundles: Api<AppBundle> = Api::all(client);
    let shutdown = ctx.cancel.clone();

    tracing::info!(concurrency, "- AppBundle controller");

    Controller::new(bundles, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerRuntimeConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("AppBundle"))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
