//! ringkv-cli: interactive client for ringkv.
//!
//! Runs a single command when one is given on the command line, or
//! opens a REPL otherwise. Requests are routed to the node owning the
//! key using the ring's `keyrange` table.

mod client;
mod connection;
mod format;
mod repl;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use ringkv_cluster::Endpoint;
use ringkv_protocol::{Command, Reply};

use crate::client::Client;
use crate::format::format_reply;

#[derive(Parser)]
#[command(name = "ringkv-cli", about = "interactive client for ringkv")]
struct Args {
    /// any node of the ring
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// that node's client port
    #[arg(short, long, default_value_t = 5551)]
    port: u16,

    /// attempts per request before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// connect and reply timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// command to run; starts the REPL when empty
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    if args.command.is_empty() {
        repl::run_repl(&args.host, args.port, args.retries, timeout);
        ExitCode::SUCCESS
    } else {
        run_oneshot(&args, timeout)
    }
}

/// Runs one command and exits. The exit code is non-zero when the
/// request failed or the server answered with an error.
fn run_oneshot(args: &Args, timeout: Duration) -> ExitCode {
    let cmd = match Command::parse(&args.command.join(" ")) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("{}", format!("invalid command: {e}").red());
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", format!("failed to create runtime: {e}").red());
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(async {
        let mut client = Client::new(Endpoint::new(&args.host, args.port), args.retries, timeout);
        let result = client.execute(&cmd).await;
        client.close().await;
        match result {
            Ok(reply) => {
                println!("{}", format_reply(&reply));
                if is_error(&reply) {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("could not reach {}:{}: {e}", args.host, args.port).red()
                );
                ExitCode::FAILURE
            }
        }
    })
}

fn is_error(reply: &Reply) -> bool {
    matches!(
        reply,
        Reply::PutError { .. }
            | Reply::GetError { .. }
            | Reply::DeleteError { .. }
            | Reply::Error(_)
    ) || reply.is_retryable()
}
