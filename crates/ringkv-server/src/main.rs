mod agent;
mod config;
mod connection;
mod server;

use std::path::PathBuf;

use clap::Parser;

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "ringkv-server", about = "ringkv storage node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "RINGKV_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to and advertise to the ring
    #[arg(long, env = "RINGKV_HOST")]
    host: Option<String>,

    /// client port to listen on
    #[arg(short, long, env = "RINGKV_PORT")]
    port: Option<u16>,

    /// peer port for coordinator and node traffic (0 = ephemeral)
    #[arg(long, env = "RINGKV_PEER_PORT")]
    peer_port: Option<u16>,

    /// coordinator address, host:port
    #[arg(short = 'b', long, env = "RINGKV_COORDINATOR")]
    coordinator: Option<String>,

    /// number of entries in the read cache (0 disables it)
    #[arg(long, env = "RINGKV_CACHE_CAPACITY")]
    cache_capacity: Option<usize>,

    /// maximum number of concurrent client connections
    #[arg(long, env = "RINGKV_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// connect and write timeout for peer deliveries, in milliseconds
    #[arg(long, env = "RINGKV_PEER_TIMEOUT_MS")]
    peer_timeout_ms: Option<u64>,

    /// idle client connection timeout in seconds
    #[arg(long, env = "RINGKV_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,
}

/// Applies CLI overrides to a `NodeConfig`. Only `Some` values take
/// effect, so the resolution order stays defaults, TOML file, env vars,
/// CLI flags.
fn apply_args(cfg: &mut NodeConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(port) = args.peer_port {
        cfg.peer_port = port;
    }
    if let Some(ref coordinator) = args.coordinator {
        cfg.coordinator = coordinator.clone();
    }
    if let Some(v) = args.cache_capacity {
        cfg.cache_capacity = v;
    }
    if let Some(v) = args.max_connections {
        cfg.max_connections = v;
    }
    if let Some(v) = args.peer_timeout_ms {
        cfg.peer_timeout_ms = v;
    }
    if let Some(v) = args.idle_timeout_secs {
        cfg.idle_timeout_secs = v;
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
        match NodeConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => NodeConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if cfg.port == 0 {
        exit_err("port must be non-zero: it fixes the node's ring position");
    }
    if let Err(e) = cfg.coordinator_endpoint() {
        exit_err(e);
    }

    if let Err(e) = server::run(cfg).await {
        exit_err(format!("server error: {e}"));
    }
}
