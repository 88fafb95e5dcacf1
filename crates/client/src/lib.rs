//! Client side of the parcel transfer protocol.
//!
//! A transfer is one [`TransferPlan`] (download or upload) run through
//! [`transfer`], which repeats whole attempts while the server answers
//! `ERROR:BUSY`. Each attempt resumes from the local `.part` sidecar.

mod remote;
mod retry;
mod session;

pub use remote::{RemoteSpec, TransferPlan};
pub use retry::{RetryPolicy, run_with_retry};
pub use session::{attempt, download, upload};

use std::path::PathBuf;

use parcel_protocol::{DEFAULT_PORT, ErrorKind, ProtocolError, RequestError};
use parcel_transfer::{TransferError, TransferOutcome};
use tracing::debug;

/// Client settings shared by every attempt.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server port.
    pub port: u16,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Errors that end a transfer without a resumable outcome.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("server rejected the request: {0}")]
    Server(ErrorKind),

    #[error("server still busy after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("local file not found: {}", .0.display())]
    LocalNotFound(PathBuf),
}

impl ClientError {
    /// Only a busy server is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Server(ErrorKind::Busy))
    }
}

/// Runs `plan` to a terminal outcome, retrying while the server is busy.
///
/// An interrupted stream is not an error: it comes back as
/// [`TransferOutcome::Partial`] with the resumable state left on disk.
pub async fn transfer(
    plan: &TransferPlan,
    config: &ClientConfig,
) -> Result<TransferOutcome, ClientError> {
    run_with_retry(&config.retry, |attempt_no| async move {
        debug!(attempt = attempt_no, "starting transfer attempt");
        attempt(plan, config.port).await
    })
    .await
}
