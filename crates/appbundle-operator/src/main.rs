//! AppBundle operator - ordered, readiness-gated deployment of multi-tier applications

mod config;
mod controller_runner;
mod crds;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use appbundle_common::kube_utils::create_client;
use appbundle_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use appbundle_controller::Context;

use crate::config::{Cli, Commands, ControllerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::appbundle_crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::from_env(),
    };
    let result = run_controller(args).await;

    shutdown_telemetry();
    result
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref()).await?;

    if args.install_crd {
        crds::ensure_appbundle_crd(&client, &args.field_manager).await?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, stopping controller");
            cancel.cancel();
        }
    });

    let config = args.controller_config();
    tracing::info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        readiness_timeout_secs = config.readiness_timeout.as_secs(),
        resync_interval_secs = config.resync_interval.as_secs(),
        field_manager = %config.field_manager,
        "starting AppBundle operator"
    );
    let ctx = Arc::new(Context::from_client(client.clone(), config, cancel));

    controller_runner::build_appbundle_controller(client, ctx, args.concurrency).await;

    tracing::info!("AppBundle operator stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
