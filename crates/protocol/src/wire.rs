//! Async framing for handshake lines.
//!
//! Readers take an [`AsyncBufRead`] so bytes that arrive in the same segment
//! as the handshake line (the start of the payload) stay buffered for the
//! caller instead of being consumed by the line reader.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::request::{Mode, TransferRequest};
use crate::response::ServerResponse;
use crate::{MAX_HANDSHAKE_LEN, ProtocolError};

/// Reads one handshake line of at most [`MAX_HANDSHAKE_LEN`] bytes.
///
/// The terminator is optional. A peer that sends its line without `\n` and
/// then waits for the answer is served from the first buffered segment, so
/// a line without a newline must arrive in one write. Bytes after the
/// newline stay buffered.
pub async fn read_handshake_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<String, ProtocolError> {
    let (line, used) = {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let used = match available.iter().position(|&b| b == b'\n') {
            Some(newline) => newline + 1,
            None => available.len(),
        };
        if used > MAX_HANDSHAKE_LEN {
            return Err(ProtocolError::LineTooLong);
        }
        (available[..used].to_vec(), used)
    };
    reader.consume(used);

    String::from_utf8(line).map_err(|_| ProtocolError::InvalidEncoding)
}

/// Reads and parses a request line.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<TransferRequest, ProtocolError> {
    let line = read_handshake_line(reader).await?;
    Ok(TransferRequest::parse(&line)?)
}

/// Reads and decodes the response to a request sent with `mode`.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    mode: Mode,
) -> Result<ServerResponse, ProtocolError> {
    let line = read_handshake_line(reader).await?;
    ServerResponse::decode(&line, mode)
}

/// Writes a request line and flushes.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &TransferRequest,
) -> Result<(), ProtocolError> {
    writer.write_all(request.encode().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a response line and flushes.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ServerResponse,
) -> Result<(), ProtocolError> {
    writer.write_all(response.encode().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
