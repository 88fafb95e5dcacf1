//! One transfer attempt: connect, handshake, stream.
//!
//! Failing to connect or to complete the handshake is an error. Once the
//! server has accepted the request, a broken connection only makes the
//! outcome [`TransferOutcome::Partial`]. An upload the server answers with
//! an error line instead of a close fails the attempt.

use std::io;
use std::path::Path;

use parcel_protocol::wire::{read_handshake_line, read_response, write_request};
use parcel_protocol::{Mode, ProtocolError, ServerResponse, TransferRequest};
use parcel_transfer::{
    BUFFER_SIZE, ProgressLog, StreamEnd, TransferOutcome, Unthrottled, download_resume_offset,
    finalize_partial, part_path, receive_into, remove_offset_marker, send_file,
    upload_resume_offset, write_offset_marker,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::remote::{RemoteSpec, TransferPlan};
use crate::ClientError;

/// Runs one attempt of `plan` against `port` on the remote host.
pub async fn attempt(plan: &TransferPlan, port: u16) -> Result<TransferOutcome, ClientError> {
    match plan {
        TransferPlan::Download { remote, local } => download(remote, local, port).await,
        TransferPlan::Upload { local, remote } => upload(local, remote, port).await,
    }
}

/// Downloads `remote` into `local`, resuming from `<local>.part`.
pub async fn download(
    remote: &RemoteSpec,
    local: &Path,
    port: u16,
) -> Result<TransferOutcome, ClientError> {
    let offset = download_resume_offset(local).await?;
    if offset > 0 {
        info!(offset, path = %local.display(), "resuming download");
    }
    let request = TransferRequest::new(Mode::Recv, offset, remote.path.as_str())?;

    let stream = connect(remote, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);

    write_request(&mut writer, &request).await?;
    let remaining = match read_response(&mut reader, Mode::Recv).await? {
        ServerResponse::OkWithRemaining(remaining) => remaining,
        ServerResponse::Error(kind) => return Err(ClientError::Server(kind)),
        other => {
            return Err(unexpected(&other));
        }
    };
    let total = offset.checked_add(remaining).ok_or_else(|| {
        ProtocolError::UnexpectedResponse(format!("OK|{remaining} past offset {offset}"))
    })?;
    debug!(offset, remaining, "download accepted");

    let part = part_path(local);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&part)
        .await?;

    let mut progress = ProgressLog::new(offset, Some(total)).verbose(true);
    let report = receive_into(
        &mut reader,
        &mut file,
        offset,
        Some(remaining),
        &Unthrottled,
        &mut progress,
    )
    .await?;

    let outcome = match report.end {
        StreamEnd::Reached => {
            finalize_partial(file, &part, local).await?;
            TransferOutcome::Complete {
                size: report.position,
            }
        }
        StreamEnd::Eof => {
            file.sync_all().await?;
            TransferOutcome::Partial {
                position: report.position,
                reason: "server closed the connection early".into(),
            }
        }
        StreamEnd::Interrupted(e) => {
            file.sync_all().await?;
            TransferOutcome::Partial {
                position: report.position,
                reason: e.to_string(),
            }
        }
    };

    log_outcome(&outcome, local, &part);
    Ok(outcome)
}

/// Uploads `local` to `remote`, resuming from the offset recorded in
/// `<local>.part`.
pub async fn upload(
    local: &Path,
    remote: &RemoteSpec,
    port: u16,
) -> Result<TransferOutcome, ClientError> {
    let size = match tokio::fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Err(ClientError::LocalNotFound(local.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ClientError::LocalNotFound(local.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let marker = part_path(local);
    let offset = upload_resume_offset(local, size).await;
    if offset > 0 {
        info!(offset, size, path = %local.display(), "resuming upload");
    }

    let mut file = File::open(local).await?;
    let request = TransferRequest::new(Mode::Send, offset, remote.path.as_str())?;

    let stream = connect(remote, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_request(&mut writer, &request).await?;
    let start = match read_response(&mut reader, Mode::Send).await? {
        ServerResponse::Ok => offset,
        ServerResponse::ResumeFrom(held) => {
            info!(declared = offset, held, "server holds less than recorded, rewinding");
            let start = held.min(size);
            write_offset_marker(&marker, start).await?;
            start
        }
        ServerResponse::Error(kind) => return Err(ClientError::Server(kind)),
        other => {
            return Err(unexpected(&other));
        }
    };

    let mut progress = ProgressLog::new(start, Some(size)).verbose(true);
    let report = send_file(
        &mut file,
        &mut writer,
        start,
        Some(size - start),
        &Unthrottled,
        Some(&marker),
        &mut progress,
    )
    .await?;

    let outcome = match report.end {
        StreamEnd::Reached => {
            finish_upload(&mut writer, &mut reader, &marker, report.position).await?
        }
        StreamEnd::Eof => TransferOutcome::Partial {
            position: report.position,
            reason: "local file shrank while sending".into(),
        },
        StreamEnd::Interrupted(e) => TransferOutcome::Partial {
            position: report.position,
            reason: e.to_string(),
        },
    };

    log_outcome(&outcome, local, &marker);
    Ok(outcome)
}

/// Half-closes the connection after the last byte and waits for the server
/// to close its side, which it does only after the file is in place.
///
/// An error line in place of the close means the server could not finalize
/// the file; the marker is kept and the attempt fails.
async fn finish_upload<W, R>(
    writer: &mut W,
    reader: &mut R,
    marker: &Path,
    position: u64,
) -> Result<TransferOutcome, ClientError>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let reply = match writer.shutdown().await {
        Ok(()) => read_handshake_line(reader).await,
        Err(e) => Err(e.into()),
    };

    match reply {
        Err(ProtocolError::ConnectionClosed) => {
            if let Err(e) = remove_offset_marker(marker).await {
                warn!(marker = %marker.display(), "failed to remove offset marker: {e}");
            }
            Ok(TransferOutcome::Complete { size: position })
        }
        Ok(line) => {
            keep_marker(marker, position).await;
            match ServerResponse::decode(&line, Mode::Send)? {
                ServerResponse::Error(kind) => Err(ClientError::Server(kind)),
                other => Err(unexpected(&other)),
            }
        }
        Err(e) => {
            keep_marker(marker, position).await;
            Ok(TransferOutcome::Partial {
                position,
                reason: format!("server did not confirm completion: {e}"),
            })
        }
    }
}

async fn keep_marker(marker: &Path, position: u64) {
    if let Err(e) = write_offset_marker(marker, position).await {
        warn!(marker = %marker.display(), "failed to update offset marker: {e}");
    }
}

async fn connect(remote: &RemoteSpec, port: u16) -> Result<TcpStream, ClientError> {
    let addr = format!("{}:{port}", remote.host);
    match TcpStream::connect((remote.host.as_str(), port)).await {
        Ok(stream) => {
            info!(%addr, "connected");
            Ok(stream)
        }
        Err(source) => Err(ClientError::Connect { addr, source }),
    }
}

fn unexpected(response: &ServerResponse) -> ClientError {
    ProtocolError::UnexpectedResponse(response.encode().trim_end().to_string()).into()
}

fn log_outcome(outcome: &TransferOutcome, local: &Path, part: &Path) {
    match outcome {
        TransferOutcome::Complete { size } => {
            info!(size, path = %local.display(), "transfer complete");
        }
        TransferOutcome::Partial { position, reason } => {
            warn!(
                position,
                part = %part.display(),
                "transfer interrupted, progress saved: {reason}"
            );
        }
    }
}
