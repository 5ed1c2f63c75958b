//! skerry command-line client.
//!
//! Each subcommand maps onto one client operation and prints its result as
//! JSON on stdout. Logs go to stderr, filtered by `RUST_LOG`.
//!
//! ```text
//! skerry sandbox create --template python-base-v1 --timeout 600
//! skerry code <sandbox-id> 'print(1 + 1)'
//! skerry run <sandbox-id> -- ls -la /home/user
//! skerry exec 'import sys; print(sys.version)'
//! skerry sandbox kill <sandbox-id>
//! ```

mod commands;
mod config;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "skerry", version, about = "Manage remote code-execution sandboxes")]
struct Cli {
    #[command(flatten)]
    connection: config::ConnectionArgs,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries results; logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skerry=info,skerry_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.connection.client_config()?;
    let client = skerry_core::Client::new(config)?;
    commands::execute(&client, cli.command).await
}
