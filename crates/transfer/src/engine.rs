//! Chunked streaming between a file and a socket.
//!
//! The loops distinguish two kinds of failure. Local file errors (seek,
//! read, write, fsync) abort the loop with [`TransferError::Io`]. Network
//! errors end the loop normally with [`StreamEnd::Interrupted`] so the
//! caller can keep its resumable state and report a partial transfer.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::checkpoint::Checkpointer;
use crate::progress::ProgressLog;
use crate::sidecar::write_offset_marker;
use crate::throttle::Throttle;
use crate::{BUFFER_SIZE, TransferError};

/// How a streaming loop ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The expected byte count was reached.
    Reached,
    /// The source ran dry: local EOF when sending, peer EOF when receiving.
    Eof,
    /// A network read or write failed.
    Interrupted(io::Error),
}

/// Result of one streaming loop.
#[derive(Debug)]
pub struct StreamReport {
    /// Absolute file position after the loop.
    pub position: u64,
    /// Payload bytes moved by this loop.
    pub moved: u64,
    pub end: StreamEnd,
}

/// Terminal state of one transfer attempt that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// All bytes arrived and the target is in place.
    Complete { size: u64 },
    /// The stream stopped early; resumable state was kept.
    Partial { position: u64, reason: String },
}

impl TransferOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, TransferOutcome::Complete { .. })
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Complete { size } => write!(f, "complete ({size} bytes)"),
            TransferOutcome::Partial { position, reason } => {
                write!(f, "interrupted at {position} bytes: {reason}")
            }
        }
    }
}

/// Streams `file` from `start` into `sink`.
///
/// Stops after `limit` bytes when given, otherwise at local EOF. When
/// `marker` is set, the absolute position is written to it every time a
/// checkpoint boundary is crossed and once more if the stream is cut.
pub async fn send_file<W, T>(
    file: &mut File,
    sink: &mut W,
    start: u64,
    limit: Option<u64>,
    throttle: &T,
    marker: Option<&Path>,
    progress: &mut ProgressLog,
) -> Result<StreamReport, TransferError>
where
    W: AsyncWrite + Unpin,
    T: Throttle,
{
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut checkpoints = Checkpointer::new(start);
    let mut position = start;
    let mut moved = 0u64;

    let end = 'stream: loop {
        let want = match limit {
            Some(limit) if moved >= limit => break StreamEnd::Reached,
            Some(limit) => BUFFER_SIZE.min((limit - moved) as usize),
            None => BUFFER_SIZE,
        };

        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break StreamEnd::Eof;
        }

        let mut sent = 0;
        while sent < n {
            let quota = throttle.acquire(n - sent).await;
            let written = match sink.write(&buf[sent..sent + quota]).await {
                Ok(0) => break 'stream StreamEnd::Interrupted(io::ErrorKind::WriteZero.into()),
                Ok(w) => w,
                Err(e) => break 'stream StreamEnd::Interrupted(e),
            };
            throttle.consume(written);
            sent += written;
            position += written as u64;
            moved += written as u64;

            if let Some(marker) = marker
                && checkpoints.crossed(position)
            {
                save_marker(marker, position).await;
            }
        }
        progress.update(position);
    };

    let end = match end {
        StreamEnd::Interrupted(e) => StreamEnd::Interrupted(e),
        done => match sink.flush().await {
            Ok(()) => done,
            Err(e) => StreamEnd::Interrupted(e),
        },
    };

    if let (Some(marker), StreamEnd::Interrupted(_)) = (marker, &end) {
        save_marker(marker, position).await;
    }

    debug!(position, moved, end = ?end, "send loop finished");
    Ok(StreamReport {
        position,
        moved,
        end,
    })
}

/// Streams `source` into `file` starting at `start`.
///
/// Stops after `expected` bytes when given, otherwise at peer EOF. The file
/// is fsynced whenever a checkpoint boundary is crossed.
pub async fn receive_into<R, T>(
    source: &mut R,
    file: &mut File,
    start: u64,
    expected: Option<u64>,
    throttle: &T,
    progress: &mut ProgressLog,
) -> Result<StreamReport, TransferError>
where
    R: AsyncRead + Unpin,
    T: Throttle,
{
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut checkpoints = Checkpointer::new(start);
    let mut position = start;
    let mut moved = 0u64;

    let end = loop {
        let want = match expected {
            Some(expected) if moved >= expected => break StreamEnd::Reached,
            Some(expected) => BUFFER_SIZE.min((expected - moved) as usize),
            None => BUFFER_SIZE,
        };

        let quota = throttle.acquire(want).await;
        let n = match source.read(&mut buf[..quota]).await {
            Ok(0) => break StreamEnd::Eof,
            Ok(n) => n,
            Err(e) => break StreamEnd::Interrupted(e),
        };
        throttle.consume(n);

        file.write_all(&buf[..n]).await?;
        position += n as u64;
        moved += n as u64;

        if checkpoints.crossed(position) {
            file.sync_all().await?;
            debug!(position, "checkpoint synced");
        }
        progress.update(position);
    };

    file.flush().await?;

    debug!(position, moved, end = ?end, "receive loop finished");
    Ok(StreamReport {
        position,
        moved,
        end,
    })
}

async fn save_marker(marker: &Path, position: u64) {
    match write_offset_marker(marker, position).await {
        Ok(()) => debug!(position, "offset marker updated"),
        Err(e) => warn!(marker = %marker.display(), "failed to update offset marker: {e}"),
    }
}
