//! One connection: handshake, validation, then a single transfer.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use parcel_protocol::wire::{read_request, write_response};
use parcel_protocol::{ErrorKind, Mode, ProtocolError, ServerResponse, TransferRequest};
use parcel_transfer::{
    BUFFER_SIZE, ProgressLog, StreamEnd, StreamReport, TransferOutcome, finalize_partial,
    part_path, receive_into, resolve_under, send_file,
};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::ServerError;
use crate::state::SharedServerState;

/// How a served connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The request was answered with an error line.
    Rejected(ErrorKind),
    /// A transfer ran, completely or not.
    Transfer(TransferOutcome),
    /// The peer closed before sending a request.
    Closed,
}

/// Serves one admitted connection rooted at `root`.
///
/// Errors from the handshake are answered on the wire and reported as
/// [`ConnectionOutcome::Rejected`]. An `Err` means the connection broke
/// while the server had something to say, or a local file operation failed
/// after the transfer was accepted.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: &SharedServerState,
    root: &Path,
) -> Result<ConnectionOutcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);

    let request = match read_request(&mut reader).await {
        Ok(request) => request,
        Err(ProtocolError::ConnectionClosed) => {
            debug!(%peer, "connection closed before handshake");
            return Ok(ConnectionOutcome::Closed);
        }
        Err(ProtocolError::Request(e)) => {
            return Ok(reject(&mut writer, peer, e.kind(), &e).await);
        }
        Err(e @ (ProtocolError::LineTooLong | ProtocolError::InvalidEncoding)) => {
            return Ok(reject(&mut writer, peer, ErrorKind::Invalid, &e).await);
        }
        Err(e) => return Err(e.into()),
    };

    let target = match resolve_under(root, &request.path) {
        Ok(target) => target,
        Err(e) => return Ok(reject(&mut writer, peer, ErrorKind::Invalid, &e).await),
    };

    let Some(_claim) = state.in_flight.claim(&claim_key(&request.path)) else {
        let detail = format!("{} is already being transferred", request.path);
        return Ok(reject(&mut writer, peer, ErrorKind::Busy, &detail).await);
    };

    info!(
        %peer,
        mode = %request.mode,
        offset = request.offset,
        path = %request.path,
        "transfer requested"
    );

    let outcome = match request.mode {
        Mode::Recv => serve_download(&mut writer, peer, state, &request, &target).await?,
        Mode::Send => {
            serve_upload(&mut reader, &mut writer, peer, state, &request, &target).await?
        }
    };

    if let ConnectionOutcome::Transfer(transfer) = &outcome {
        if transfer.is_complete() {
            info!(%peer, path = %request.path, "transfer {transfer}");
        } else {
            warn!(%peer, path = %request.path, "transfer {transfer}");
        }
    }
    Ok(outcome)
}

/// Streams `target` to the client starting at the requested offset.
async fn serve_download<W>(
    writer: &mut W,
    peer: SocketAddr,
    state: &SharedServerState,
    request: &TransferRequest,
    target: &Path,
) -> Result<ConnectionOutcome, ServerError>
where
    W: AsyncWrite + Unpin,
{
    let size = match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            let detail = format!("{} is not a regular file", request.path);
            return Ok(reject(writer, peer, ErrorKind::NotFound, &detail).await);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(reject(writer, peer, ErrorKind::NotFound, &e).await);
        }
        Err(e) => return Ok(reject(writer, peer, ErrorKind::Io, &e).await),
    };

    let start = request.offset.min(size);
    let remaining = size - start;

    let mut file = match tokio::fs::File::open(target).await {
        Ok(file) => file,
        Err(e) => return Ok(reject(writer, peer, ErrorKind::Io, &e).await),
    };

    write_response(writer, &ServerResponse::OkWithRemaining(remaining)).await?;

    let mut progress = ProgressLog::new(start, Some(size));
    let report = send_file(
        &mut file,
        writer,
        start,
        Some(remaining),
        state,
        None,
        &mut progress,
    )
    .await?;

    let outcome = match report.end {
        StreamEnd::Reached => TransferOutcome::Complete { size },
        StreamEnd::Eof => TransferOutcome::Partial {
            position: report.position,
            reason: "file shrank while sending".into(),
        },
        StreamEnd::Interrupted(ref e) => TransferOutcome::Partial {
            position: report.position,
            reason: e.to_string(),
        },
    };

    close_writer(writer, peer).await;
    Ok(ConnectionOutcome::Transfer(outcome))
}

/// Receives the client's bytes into `<target>.part` and renames it into
/// place on a clean end of stream.
///
/// If the client declares an offset beyond what the partial file holds, the
/// server answers `OK|<held>` and the client restarts from there. A smaller
/// offset truncates the partial file to it.
async fn serve_upload<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    state: &SharedServerState,
    request: &TransferRequest,
    target: &Path,
) -> Result<ConnectionOutcome, ServerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(parent) = target.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        return Ok(reject(writer, peer, ErrorKind::Io, &e).await);
    }

    let part = part_path(target);
    let mut file = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&part)
        .await
    {
        Ok(file) => file,
        Err(e) => return Ok(reject(writer, peer, ErrorKind::Io, &e).await),
    };

    let held = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return Ok(reject(writer, peer, ErrorKind::Io, &e).await),
    };

    let (start, response) = if request.offset <= held {
        if let Err(e) = file.set_len(request.offset).await {
            return Ok(reject(writer, peer, ErrorKind::Io, &e).await);
        }
        (request.offset, ServerResponse::Ok)
    } else {
        debug!(%peer, declared = request.offset, held, "client is ahead of partial file");
        (held, ServerResponse::ResumeFrom(held))
    };

    write_response(writer, &response).await?;

    let mut progress = ProgressLog::new(start, None);
    let StreamReport { position, end, .. } =
        match receive_into(reader, &mut file, start, None, state, &mut progress).await {
            Ok(report) => report,
            Err(e) => return Err(fail_local(writer, peer, e).await),
        };

    let outcome = match end {
        StreamEnd::Eof | StreamEnd::Reached => {
            if let Err(e) = finalize_partial(file, &part, target).await {
                return Err(fail_local(writer, peer, e).await);
            }
            TransferOutcome::Complete { size: position }
        }
        StreamEnd::Interrupted(e) => {
            file.sync_all().await?;
            TransferOutcome::Partial {
                position,
                reason: e.to_string(),
            }
        }
    };

    close_writer(writer, peer).await;
    Ok(ConnectionOutcome::Transfer(outcome))
}

/// Sends `ERROR:<kind>` and closes the write side.
async fn reject<W>(
    writer: &mut W,
    peer: SocketAddr,
    kind: ErrorKind,
    detail: &(dyn std::fmt::Display + Sync),
) -> ConnectionOutcome
where
    W: AsyncWrite + Unpin,
{
    warn!(%peer, error = kind.as_str(), "rejecting request: {detail}");
    if let Err(e) = write_response(writer, &ServerResponse::Error(kind)).await {
        debug!(%peer, "failed to send rejection: {e}");
    }
    close_writer(writer, peer).await;
    ConnectionOutcome::Rejected(kind)
}

/// Answers `ERROR:IO` for a local failure after the request was accepted,
/// so the client does not take the close for a confirmation.
async fn fail_local<W, E>(writer: &mut W, peer: SocketAddr, error: E) -> ServerError
where
    W: AsyncWrite + Unpin,
    E: Into<ServerError> + std::fmt::Display,
{
    debug!(%peer, "local failure during upload: {error}");
    if let Err(e) = write_response(writer, &ServerResponse::Error(ErrorKind::Io)).await {
        debug!(%peer, "failed to send IO error: {e}");
    }
    close_writer(writer, peer).await;
    error.into()
}

async fn close_writer<W: AsyncWrite + Unpin>(writer: &mut W, peer: SocketAddr) {
    if let Err(e) = writer.shutdown().await {
        debug!(%peer, "shutdown failed: {e}");
    }
}

/// Normalized key for in-flight tracking, so `a/b` and `./a/./b` collide.
fn claim_key(remote: &str) -> PathBuf {
    Path::new(remote)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateLimiter;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};
    use tokio::task::JoinHandle;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn state() -> Arc<SharedServerState> {
        Arc::new(SharedServerState::new(RateLimiter::new(u64::MAX), 8))
    }

    fn spawn_handler(
        root: &Path,
        state: Arc<SharedServerState>,
    ) -> (DuplexStream, JoinHandle<Result<ConnectionOutcome, ServerError>>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let root = root.to_path_buf();
        let handle =
            tokio::spawn(async move { handle_connection(server, peer(), &state, &root).await });
        (client, handle)
    }

    /// Sends `line` and returns everything the server writes back.
    async fn exchange(root: &Path, line: &[u8]) -> (Vec<u8>, ConnectionOutcome) {
        let (mut client, handle) = spawn_handler(root, state());
        client.write_all(line).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        (reply, handle.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn download_whole_file() {
        let dir = TempDir::new().unwrap();
        let data = pattern(10_000);
        std::fs::write(dir.path().join("a.bin"), &data).unwrap();

        let (reply, outcome) = exchange(dir.path(), b"RECV|0|a.bin\n").await;

        let mut expected = b"OK|10000\n".to_vec();
        expected.extend_from_slice(&data);
        assert_eq!(reply, expected);
        assert_eq!(
            outcome,
            ConnectionOutcome::Transfer(TransferOutcome::Complete { size: 10_000 })
        );
    }

    #[tokio::test]
    async fn download_from_offset() {
        let dir = TempDir::new().unwrap();
        let data = pattern(5_000);
        std::fs::write(dir.path().join("a.bin"), &data).unwrap();

        let (reply, _) = exchange(dir.path(), b"RECV|4000|a.bin\n").await;

        let mut expected = b"OK|1000\n".to_vec();
        expected.extend_from_slice(&data[4000..]);
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn download_offset_past_end_is_clamped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin"), pattern(100)).unwrap();

        let (reply, outcome) = exchange(dir.path(), b"RECV|9999|a.bin\n").await;
        assert_eq!(reply, b"OK|0\n");
        assert_eq!(
            outcome,
            ConnectionOutcome::Transfer(TransferOutcome::Complete { size: 100 })
        );
    }

    #[tokio::test]
    async fn download_missing_file() {
        let dir = TempDir::new().unwrap();
        let (reply, outcome) = exchange(dir.path(), b"RECV|0|nope.bin\n").await;
        assert_eq!(reply, b"ERROR:NOT_FOUND\n");
        assert_eq!(outcome, ConnectionOutcome::Rejected(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn download_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (reply, _) = exchange(dir.path(), b"RECV|0|sub\n").await;
        assert_eq!(reply, b"ERROR:NOT_FOUND\n");
    }

    #[tokio::test]
    async fn malformed_handshakes() {
        let dir = TempDir::new().unwrap();

        let (reply, _) = exchange(dir.path(), b"RECV|0\n").await;
        assert_eq!(reply, b"ERROR:INVALID\n");

        let (reply, _) = exchange(dir.path(), b"RECV|abc|a.bin\n").await;
        assert_eq!(reply, b"ERROR:INVALID\n");

        let (reply, outcome) = exchange(dir.path(), b"PUSH|0|a.bin\n").await;
        assert_eq!(reply, b"ERROR:MODE\n");
        assert_eq!(outcome, ConnectionOutcome::Rejected(ErrorKind::Mode));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (reply, _) = exchange(dir.path(), b"RECV|0|../etc/passwd\n").await;
        assert_eq!(reply, b"ERROR:INVALID\n");

        let (reply, _) = exchange(dir.path(), b"SEND|0|/tmp/evil\n").await;
        assert_eq!(reply, b"ERROR:INVALID\n");
    }

    #[tokio::test]
    async fn overlong_handshake_is_invalid() {
        let dir = TempDir::new().unwrap();
        let mut line = b"RECV|0|".to_vec();
        line.extend(std::iter::repeat_n(b'x', 4096));
        line.push(b'\n');

        let (reply, _) = exchange(dir.path(), &line).await;
        assert_eq!(reply, b"ERROR:INVALID\n");
    }

    #[tokio::test]
    async fn closed_before_handshake() {
        let dir = TempDir::new().unwrap();
        let (reply, outcome) = exchange(dir.path(), b"").await;
        assert!(reply.is_empty());
        assert_eq!(outcome, ConnectionOutcome::Closed);
    }

    #[tokio::test]
    async fn same_path_in_flight_is_busy() {
        let dir = TempDir::new().unwrap();
        let state = state();
        let _held = state.in_flight.claim(Path::new("shared/a.bin")).unwrap();

        let (mut client, handle) = spawn_handler(dir.path(), Arc::clone(&state));
        client.write_all(b"SEND|0|./shared/a.bin\n").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"ERROR:BUSY\n");
        assert_eq!(
            handle.await.unwrap().unwrap(),
            ConnectionOutcome::Rejected(ErrorKind::Busy)
        );
    }

    #[tokio::test]
    async fn upload_creates_target() {
        let dir = TempDir::new().unwrap();
        let data = pattern(9_000);

        let mut line = b"SEND|0|in/new.bin\n".to_vec();
        line.extend_from_slice(&data);
        let (reply, outcome) = exchange(dir.path(), &line).await;

        assert_eq!(reply, b"OK\n");
        assert_eq!(
            outcome,
            ConnectionOutcome::Transfer(TransferOutcome::Complete { size: 9_000 })
        );
        let target = dir.path().join("in/new.bin");
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(!part_path(&target).exists());
    }

    #[tokio::test]
    async fn upload_truncates_to_declared_offset() {
        let dir = TempDir::new().unwrap();
        let data = pattern(2_000);
        let target = dir.path().join("up.bin");
        // The partial holds 500 bytes but the client only checkpointed 256.
        std::fs::write(part_path(&target), &data[..500]).unwrap();

        let mut line = b"SEND|256|up.bin\n".to_vec();
        line.extend_from_slice(&data[256..]);
        let (reply, _) = exchange(dir.path(), &line).await;

        assert_eq!(reply, b"OK\n");
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn upload_ahead_of_partial_gets_resume_point() {
        let dir = TempDir::new().unwrap();
        let data = pattern(2_000);
        let target = dir.path().join("up.bin");
        std::fs::write(part_path(&target), &data[..300]).unwrap();

        let (mut client, handle) = spawn_handler(dir.path(), state());
        client.write_all(b"SEND|1024|up.bin\n").await.unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"OK|300\n");

        client.write_all(&data[300..]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        assert_eq!(
            handle.await.unwrap().unwrap(),
            ConnectionOutcome::Transfer(TransferOutcome::Complete { size: 2_000 })
        );
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn upload_onto_directory_answers_io_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/keep.txt"), b"x").unwrap();

        let (mut client, handle) = spawn_handler(dir.path(), state());
        let mut line = b"SEND|0|d\n".to_vec();
        line.extend_from_slice(&pattern(1_000));
        client.write_all(&line).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"OK\nERROR:IO\n");

        assert!(matches!(handle.await.unwrap(), Err(ServerError::Io(_))));
        assert!(dir.path().join("d").is_dir());
        assert_eq!(
            std::fs::read(part_path(&dir.path().join("d"))).unwrap().len(),
            1_000
        );
    }

    #[tokio::test]
    async fn request_without_newline_is_answered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        // The client keeps its side open and waits for the reply.
        let (mut client, handle) = spawn_handler(dir.path(), state());
        client.write_all(b"RECV|0|a.txt").await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .expect("server should answer without a terminator")
            .unwrap();
        assert_eq!(reply, b"OK|5\nhello");
        assert_eq!(
            handle.await.unwrap().unwrap(),
            ConnectionOutcome::Transfer(TransferOutcome::Complete { size: 5 })
        );
    }

    /// Replays `input` to the reader, then fails like a reset connection.
    /// Everything written is discarded.
    struct ResetAfter {
        input: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos >= self.input.len() {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            let n = buf.remaining().min(self.input.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.input[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn interrupted_upload_keeps_partial() {
        let dir = TempDir::new().unwrap();
        let data = pattern(3_000);

        let mut input = b"SEND|0|cut.bin\n".to_vec();
        input.extend_from_slice(&data[..1_200]);
        let stream = ResetAfter { input, pos: 0 };

        let state = state();
        let outcome = handle_connection(stream, peer(), &state, dir.path())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ConnectionOutcome::Transfer(TransferOutcome::Partial { position: 1_200, .. })
        ));
        let target = dir.path().join("cut.bin");
        assert!(!target.exists());
        assert_eq!(std::fs::read(part_path(&target)).unwrap(), &data[..1_200]);
        assert!(state.in_flight.is_empty());
    }
}
