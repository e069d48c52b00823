//! chaincache - Ethereum block cache CLI
//!
//! Queries a node for blocks, transactions and traces, and keeps a sharded
//! binary copy of non-empty blocks on disk.

use anyhow::Result;
use chaincache::cli::{self, Cli};
use chaincache::lock::LockRegistry;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let result: Result<()> = tokio::select! {
        result = cli::run(args) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl+C, releasing locks");
            Ok(())
        }
    };

    LockRegistry::global().shutdown(None);

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
