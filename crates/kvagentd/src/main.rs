//! kvagentd entry point.

use anyhow::Context;
use clap::Parser;
use kvagentd::{AgentConfig, AgentDaemon, SimDataplane};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Reconciles a simulated dataplane with a desired-state file
#[derive(Parser, Debug)]
#[command(name = "kvagentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Desired-state file (YAML), overrides the configuration file
    #[arg(short = 'd', long)]
    desired: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Desired-state reload interval in seconds, 0 disables reloading
    #[arg(long)]
    reload_interval: Option<u64>,

    /// Periodic downstream resync interval in seconds, 0 disables it
    #[arg(long)]
    resync_interval: Option<u64>,

    /// Physical ports present in the simulated dataplane
    #[arg(short = 'p', long = "port", default_values_t = [String::from("eth0"), String::from("eth1")])]
    ports: Vec<String>,
}

fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(desired) = &args.desired {
        config.agent.desired_config = Some(desired.clone());
    }
    if let Some(secs) = args.reload_interval {
        config.agent.reload_interval_secs = secs;
    }
    if let Some(secs) = args.resync_interval {
        config.scheduler.resync_interval_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    match &config.agent.desired_config {
        Some(path) => info!("Desired state: {}", path.display()),
        None => warn!("No desired-state file, only discovering the dataplane"),
    }
    info!("Reload interval: {}s", config.agent.reload_interval_secs);
    info!("Resync interval: {}s", config.scheduler.resync_interval_secs);
    info!("Physical ports: {}", args.ports.join(", "));

    let dataplane = Arc::new(SimDataplane::with_physical_ports(args.ports.iter().cloned()));
    let mut daemon = AgentDaemon::new(config, dataplane).context("creating the daemon")?;
    info!("Registered descriptors: {}", daemon.scheduler().descriptor_names().join(", "));

    info!("Initializing kvagentd...");
    daemon.init().await.context("initial resync")?;
    info!("Initialization complete");

    let stop = daemon.stop_token();
    let signal_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received SIGINT, shutting down gracefully...");
                stop.cancel();
            }
            Err(err) => {
                error!("Failed to listen for ctrl-c: {}", err);
            }
        }
    });

    daemon.run().await;
    signal_handle.abort();
    daemon.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    info!("====================================================================");
    info!("Starting kvagentd");
    info!("====================================================================");

    if let Err(e) = run(args).await {
        error!("kvagentd failed: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("====================================================================");
    info!("kvagentd shutdown complete");
    info!("====================================================================");

    ExitCode::SUCCESS
}
