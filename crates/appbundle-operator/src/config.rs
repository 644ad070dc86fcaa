//! Command-line configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use appbundle_controller::package::GateConfig;
use appbundle_controller::ControllerConfig;

/// AppBundle operator - ordered, readiness-gated application deployment
#[derive(Parser, Debug)]
#[command(name = "appbundle-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the AppBundle CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the AppBundle controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ControllerArgs {
    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Seconds between readiness checks
    #[arg(long, env = "APPBUNDLE_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub poll_interval_secs: u64,

    /// Seconds to wait for a single resource to become ready
    #[arg(long, env = "APPBUNDLE_READINESS_TIMEOUT_SECS", default_value_t = 300)]
    pub readiness_timeout_secs: u64,

    /// Seconds between passes over a deployed bundle
    #[arg(long, env = "APPBUNDLE_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Bundles reconciled concurrently
    #[arg(long, env = "APPBUNDLE_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Image running kubectl in package wait gates
    #[arg(long, env = "APPBUNDLE_GATE_IMAGE", default_value = "bitnami/kubectl:latest")]
    pub gate_image: String,

    /// Rollout timeout in seconds used by package wait gates
    #[arg(long, env = "APPBUNDLE_GATE_TIMEOUT_SECS", default_value_t = 300)]
    pub gate_timeout_secs: u64,

    /// Field manager for writes to AppBundles
    #[arg(long, env = "APPBUNDLE_FIELD_MANAGER", default_value = "appbundle-controller")]
    pub field_manager: String,

    /// Install or update the AppBundle CRD on startup
    #[arg(long, env = "APPBUNDLE_INSTALL_CRD")]
    pub install_crd: bool,
}

impl ControllerArgs {
    /// Settings from the environment and defaults alone, for when no subcommand is given
    pub fn from_env() -> Self {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ControllerArgs,
        }
        Wrapper::parse_from(["appbundle-operator"]).args
    }

    /// Engine settings derived from the flags
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            gate: GateConfig {
                image: self.gate_image.clone(),
                timeout: Duration::from_secs(self.gate_timeout_secs),
                ..GateConfig::default()
            },
            field_manager: self.field_manager.clone(),
            ..ControllerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["appbundle-operator", "controller"]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.concurrency, 4);
        assert!(!args.install_crd);
        assert_eq!(args.controller_config(), ControllerConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "appbundle-operator",
            "controller",
            "--poll-interval-secs",
            "5",
            "--readiness-timeout-secs",
            "60",
            "--gate-image",
            "registry.local/kubectl:1.32",
            "--field-manager",
            "platform-team",
            "--install-crd",
        ]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        let config = args.controller_config();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.readiness().timeout, Duration::from_secs(60));
        assert_eq!(config.gate.image, "registry.local/kubectl:1.32");
        assert_eq!(config.field_manager, "platform-team");
        assert!(args.install_crd);
    }

    #[test]
    fn crd_flag_without_subcommand() {
        let cli = Cli::parse_from(["appbundle-operator", "--crd"]);
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }
}
