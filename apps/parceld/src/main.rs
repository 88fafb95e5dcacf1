//! Parcel transfer server entry point.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parcel_server::TransferServer;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::FileConfig;

/// Resumable, rate-limited file transfer server.
#[derive(Debug, Parser)]
#[command(name = "parceld", version)]
struct Cli {
    /// TCP port to listen on.
    port: u16,

    /// Maximum number of concurrently served connections.
    max_clients: usize,

    /// Shared transfer budget in bytes per second.
    rate_limit: u64,

    /// Directory that remote paths resolve under.
    #[arg(long)]
    root: Option<PathBuf>,

    /// TOML file with root, bind_address and quota_poll_ms.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parceld");

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = file_config.into_server_config(cli.port, cli.max_clients, cli.rate_limit, cli.root);
    anyhow::ensure!(
        config.root.is_dir(),
        "root {} is not a directory",
        config.root.display()
    );

    let server = TransferServer::new(config)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(server))?;

    tracing::info!("parceld shut down cleanly");
    Ok(())
}

async fn run(server: Arc<TransferServer>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(server.config().bind_address, server.config().port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, finishing active transfers");
                signal_server.shutdown();
            }
            Err(e) => tracing::warn!("failed to listen for Ctrl-C: {e}"),
        }
    });

    server.serve(listener).await?;
    Ok(())
}
