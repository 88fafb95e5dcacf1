//! Parcel transfer client entry point.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parcel_client::{ClientConfig, RetryPolicy, TransferPlan, transfer};
use parcel_protocol::DEFAULT_PORT;
use parcel_transfer::TransferOutcome;
use tracing_subscriber::EnvFilter;

/// Copy one file to or from a parcel server, resuming where a previous
/// attempt stopped.
///
/// Exactly one of SOURCE and DESTINATION is remote, written host:path.
#[derive(Debug, Parser)]
#[command(name = "parcel", version)]
struct Cli {
    /// Local path or host:remote_path to read from.
    source: String,

    /// Local path or host:remote_path to write to.
    destination: String,

    /// Server port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Retries while the server is busy.
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Seconds to wait between busy retries.
    #[arg(long, default_value_t = 2)]
    backoff_secs: u64,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(cli) {
        Ok(TransferOutcome::Complete { size }) => {
            tracing::info!(size, "done");
            ExitCode::SUCCESS
        }
        // Progress is saved; running the same command again resumes.
        Ok(TransferOutcome::Partial { position, .. }) => {
            tracing::warn!(position, "transfer incomplete, rerun to resume");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<TransferOutcome> {
    let plan = TransferPlan::from_args(&cli.source, &cli.destination)?;
    let config = ClientConfig {
        port: cli.port,
        retry: RetryPolicy {
            max_retries: cli.retries,
            backoff: Duration::from_secs(cli.backoff_secs),
        },
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = rt
        .block_on(transfer(&plan, &config))
        .with_context(|| format!("{} -> {}", cli.source, cli.destination))?;
    Ok(outcome)
}
