//! Resume bookkeeping and the chunked streaming engine.
//!
//! Both ends of a parcel transfer share this crate: the sidecar (`.part`)
//! helpers decide where a transfer restarts, [`Checkpointer`] decides when
//! progress is made durable, and the engine functions move bytes between a
//! file and a socket through a [`Throttle`].

mod checkpoint;
mod engine;
mod progress;
mod sidecar;
mod throttle;
mod validation;

pub use checkpoint::Checkpointer;
pub use engine::{StreamEnd, StreamReport, TransferOutcome, receive_into, send_file};
pub use progress::{ProgressLog, SpeedCalculator};
pub use sidecar::{
    download_resume_offset, finalize_partial, part_path, read_offset_marker,
    remove_offset_marker, upload_resume_offset, write_offset_marker,
};
pub use throttle::{Throttle, Unthrottled};
pub use validation::{resolve_under, validate_remote_path};

/// Size of the I/O buffer used by the streaming loops.
pub const BUFFER_SIZE: usize = 4096;

/// Byte granularity at which progress is made durable.
pub const CHECKPOINT_INTERVAL: u64 = 128;

/// Suffix appended to a target path to name its sidecar.
pub const PART_SUFFIX: &str = ".part";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
