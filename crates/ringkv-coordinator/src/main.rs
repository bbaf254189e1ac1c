mod actor;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::CoordinatorConfig;

#[derive(Parser)]
#[command(name = "ringkv-coordinator", about = "ringkv ring coordinator")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "RINGKV_COORDINATOR_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "RINGKV_COORDINATOR_HOST")]
    host: Option<String>,

    /// port nodes connect to
    #[arg(short, long, env = "RINGKV_COORDINATOR_PORT")]
    port: Option<u16>,

    /// milliseconds between gossip rounds
    #[arg(long, env = "RINGKV_GOSSIP_INTERVAL_MS")]
    gossip_interval_ms: Option<u64>,

    /// milliseconds between heartbeats to each node
    #[arg(long, env = "RINGKV_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    /// connect and write timeout for deliveries, in milliseconds
    #[arg(long, env = "RINGKV_PEER_TIMEOUT_MS")]
    peer_timeout_ms: Option<u64>,
}

/// Applies CLI overrides to a `CoordinatorConfig`. Only `Some` values
/// take effect.
fn apply_args(cfg: &mut CoordinatorConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(v) = args.gossip_interval_ms {
        cfg.gossip_interval_ms = v;
    }
    if let Some(v) = args.heartbeat_interval_ms {
        cfg.heartbeat_interval_ms = v;
    }
    if let Some(v) = args.peer_timeout_ms {
        cfg.peer_timeout_ms = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringkv=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match CoordinatorConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => CoordinatorConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if cfg.gossip_interval_ms == 0 || cfg.heartbeat_interval_ms == 0 {
        exit_err("gossip and heartbeat intervals must be non-zero");
    }

    let listener = match TcpListener::bind((cfg.host.as_str(), cfg.port)).await {
        Ok(l) => l,
        Err(e) => exit_err(format!("failed to bind {}:{}: {e}", cfg.host, cfg.port)),
    };
    info!(
        "coordinator listening on {}:{} (gossip every {}ms, heartbeat every {}ms)",
        cfg.host, cfg.port, cfg.gossip_interval_ms, cfg.heartbeat_interval_ms
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(e) = actor::run(listener, &cfg, shutdown).await {
        exit_err(format!("coordinator error: {e}"));
    }
}
