use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use jx_controller::client::MemoryCluster;
use jx_controller::config::{
    default_identity, ControllerConfig, ControllerConfigFile, LeaderElectionConfig,
};
use jx_controller::manifests;
use jx_controller::node::Node;
use jx_controller::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jx-controller")]
#[command(version)]
#[command(about = "Leader-elected controller for JxTask distributed jobs")]
struct Args {
    /// Namespace to watch. Empty watches every namespace.
    #[arg(long, env = "JX_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Full relist interval of the watch caches, in seconds
    #[arg(long, default_value = "30")]
    resync_period_secs: u64,

    /// Leader election identity (defaults to the hostname)
    #[arg(long)]
    identity: Option<String>,

    #[arg(long, default_value = "15")]
    lease_duration_secs: u64,

    #[arg(long, default_value = "5")]
    renew_deadline_secs: u64,

    #[arg(long, default_value = "3")]
    retry_period_secs: u64,

    /// Failed pods a task tolerates before it is marked failed
    #[arg(long, default_value = "0")]
    failure_tolerance: u32,

    /// Emit logs as JSON
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    json_log_format: bool,

    /// Port for the health endpoints (optional)
    #[arg(long)]
    health_port: Option<u16>,

    /// Directory of JxTask JSON manifests loaded into the in-memory cluster
    #[arg(long)]
    manifests: Option<PathBuf>,

    /// JSON file mapping accelerator resource names to the volumes and env they need
    #[arg(long)]
    controller_config_file: Option<PathBuf>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_config(args: &Args) -> Result<ControllerConfig, Box<dyn std::error::Error>> {
    let mut config = ControllerConfig::new(args.namespace.clone())
        .with_workers(args.workers)
        .with_identity(args.identity.clone().unwrap_or_else(default_identity))
        .with_resync_period(Duration::from_secs(args.resync_period_secs))
        .with_failure_tolerance(args.failure_tolerance)
        .with_leader_election(LeaderElectionConfig {
            lease_duration: Duration::from_secs(args.lease_duration_secs),
            renew_deadline: Duration::from_secs(args.renew_deadline_secs),
            retry_period: Duration::from_secs(args.retry_period_secs),
            ..LeaderElectionConfig::default()
        });

    if let Some(path) = &args.controller_config_file {
        let file = ControllerConfigFile::load(path)?;
        tracing::info!(
            path = %path.display(),
            accelerators = file.accelerators.len(),
            "Loaded controller config file"
        );
        config = config.with_accelerators(file.accelerators);
    }

    if let Some(port) = args.health_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_health_addr(addr);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_log_format);

    let config = build_config(&args)?;

    let cluster = MemoryCluster::new();
    if let Some(dir) = &args.manifests {
        let loaded = manifests::seed(&cluster, dir, &config.lease_namespace)?;
        tracing::info!(dir = %dir.display(), jxtasks = loaded, "Seeded in-memory cluster");
    }
    tracing::warn!("No API server transport configured, running against the in-memory cluster");

    tracing::info!(
        namespace = %config.namespace,
        identity = %config.identity,
        workers = config.workers,
        health_addr = ?config.health_addr,
        "Starting jx-controller"
    );

    let shutdown = install_shutdown_handler()?;
    Node::new(config, cluster.clients())
        .run(shutdown, |_| {})
        .await?;

    Ok(())
}
