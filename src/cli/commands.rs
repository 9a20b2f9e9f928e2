//! CLI command definitions for proxyscale.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::ScalerConfig;
use crate::controller::ControlLoop;
use crate::driver::DockerDriver;
use crate::metrics::{CpuSampler, MetricSource};
use crate::policy;
use crate::proxy::DataPlaneClient;
use crate::reconciler::Reconciler;

/// CPU-driven autoscaler for a Docker worker pool behind HAProxy.
#[derive(Parser)]
#[command(name = "proxyscale")]
#[command(about = "Autoscale a Docker worker pool behind HAProxy's Data Plane API")]
#[command(version)]
#[command(
    long_about = "proxyscale samples host CPU utilization on a fixed cadence, derives a target \
worker count, and reconciles both the running container set and the HAProxy backend member \
list to match, one configuration transaction per cycle.\n\nExample usage:\n  proxyscale run \
--image project-2 --max-workers 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Bootstrap the proxy and run the autoscaling loop until interrupted.
    Run(ScalerArgs),

    /// Run a single reconciliation cycle, then exit.
    Once(OnceArgs),

    /// Remove every backend member and stop every pool worker.
    Teardown(ScalerArgs),
}

/// Connection and pool arguments shared by all commands.
#[derive(Parser, Debug)]
pub struct ScalerArgs {
    /// HAProxy Data Plane API base URL.
    #[arg(long, env = "PROXYSCALE_DATAPLANE_URL")]
    pub dataplane_url: Option<String>,

    /// Docker image for worker containers.
    #[arg(short = 'i', long, env = "PROXYSCALE_WORKER_IMAGE")]
    pub image: Option<String>,

    /// Host port for worker ordinal 0.
    #[arg(long, env = "PROXYSCALE_BASE_PORT")]
    pub base_port: Option<u16>,

    /// Upper bound on the worker count.
    #[arg(long, env = "PROXYSCALE_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Seconds between reconciliation cycles.
    #[arg(long, env = "PROXYSCALE_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,
}

/// Arguments for `proxyscale once`.
#[derive(Parser, Debug)]
pub struct OnceArgs {
    #[command(flatten)]
    pub scaler: ScalerArgs,

    /// Explicit target worker count; when omitted, one CPU sample decides.
    #[arg(short = 't', long)]
    pub target: Option<usize>,
}

impl ScalerArgs {
    /// Builds the effective configuration: environment first, then flags.
    fn into_config(self) -> anyhow::Result<ScalerConfig> {
        let mut config = ScalerConfig::from_env()?;

        if let Some(url) = self.dataplane_url {
            config.dataplane_url = url;
        }
        if let Some(image) = self.image {
            config.worker_image = image;
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if let Some(secs) = self.interval_secs {
            config.sample_interval = std::time::Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Executes the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_loop(args.into_config()?).await,
        Commands::Once(args) => run_once(args.scaler.into_config()?, args.target).await,
        Commands::Teardown(args) => run_teardown(args.into_config()?).await,
    }
}

async fn run_loop(config: ScalerConfig) -> anyhow::Result<()> {
    let driver = Arc::new(DockerDriver::new(&config)?);
    let proxy = Arc::new(DataPlaneClient::new(&config));

    let control = ControlLoop::new(driver, proxy, CpuSampler::new(), config);

    // Bootstrap is fatal: without the frontend/backend pair there is
    // nothing to reconcile against.
    control.reconciler().bootstrap().await?;

    let shutdown = control.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown.send(());
        }
    });

    control.run().await;
    Ok(())
}

async fn run_once(config: ScalerConfig, target: Option<usize>) -> anyhow::Result<()> {
    let driver = Arc::new(DockerDriver::new(&config)?);
    let proxy = Arc::new(DataPlaneClient::new(&config));

    let target = match target {
        Some(explicit) => explicit.clamp(1, config.max_workers),
        None => {
            let cpu = CpuSampler::new().sample().await;
            let derived = policy::target_count(cpu, config.max_workers);
            info!(cpu = format_args!("{cpu:.1}"), target = derived, "Sampled CPU utilization");
            derived
        }
    };

    let reconciler = Reconciler::new(driver, proxy, config);
    reconciler.reconcile(target).await?;
    info!(target, "Reconciliation complete");
    Ok(())
}

async fn run_teardown(config: ScalerConfig) -> anyhow::Result<()> {
    let driver = Arc::new(DockerDriver::new(&config)?);
    let proxy = Arc::new(DataPlaneClient::new(&config));

    let reconciler = Reconciler::new(driver, proxy, config);
    reconciler.teardown().await?;
    Ok(())
}
