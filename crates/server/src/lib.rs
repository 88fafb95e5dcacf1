//! Concurrent, rate-limited parcel transfer server.
//!
//! One task per accepted connection, bounded by an [`Admission`] cap.
//! Connections over the cap get `ERROR:BUSY` and are closed without being
//! counted. Payload bytes in both directions share a single per-second
//! budget ([`RateLimiter`]) split evenly across the active connections.

mod admission;
mod handler;
mod paths;
mod rate;
mod server;
mod state;

pub use admission::{Admission, AdmissionPermit};
pub use handler::{ConnectionOutcome, handle_connection};
pub use paths::{InFlightPaths, PathClaim};
pub use rate::{Clock, ManualClock, RateLimiter, SystemClock};
pub use server::{ServerConfig, TransferServer};
pub use state::SharedServerState;

use std::time::Duration;

/// How long a connection sleeps before re-checking an exhausted budget.
pub const QUOTA_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors produced by the transfer server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] parcel_protocol::ProtocolError),

    #[error("transfer error: {0}")]
    Transfer(#[from] parcel_transfer::TransferError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
