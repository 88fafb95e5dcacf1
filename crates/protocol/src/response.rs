//! Response line: `OK`, `OK|<n>` or `ERROR:<KIND>`.

use std::fmt;

use crate::request::Mode;
use crate::{FIELD_DELIMITER, ProtocolError};

const OK: &str = "OK";
const ERROR_PREFIX: &str = "ERROR";

/// Error kinds a server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request line.
    Invalid,
    /// `RECV` target does not exist.
    NotFound,
    /// The server could not open, seek or finalize the target.
    Io,
    /// Unknown transfer mode.
    Mode,
    /// No capacity right now; retry later.
    Busy,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Invalid => "INVALID",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Io => "IO",
            ErrorKind::Mode => "MODE",
            ErrorKind::Busy => "BUSY",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "INVALID" => Some(ErrorKind::Invalid),
            "NOT_FOUND" => Some(ErrorKind::NotFound),
            "IO" => Some(ErrorKind::Io),
            "MODE" => Some(ErrorKind::Mode),
            "BUSY" => Some(ErrorKind::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single response that precedes any payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerResponse {
    /// `SEND` accepted at the offset the client declared.
    Ok,
    /// `RECV` accepted; this many payload bytes follow.
    OkWithRemaining(u64),
    /// `SEND` accepted, but the server only holds this many bytes of the
    /// partial file; the client must rewind its source to this offset.
    ResumeFrom(u64),
    Error(ErrorKind),
}

impl ServerResponse {
    /// Encodes the response as a newline-terminated line.
    pub fn encode(&self) -> String {
        match self {
            ServerResponse::Ok => format!("{OK}\n"),
            ServerResponse::OkWithRemaining(n) | ServerResponse::ResumeFrom(n) => {
                format!("{OK}{FIELD_DELIMITER}{n}\n")
            }
            ServerResponse::Error(kind) => format!("{ERROR_PREFIX}:{kind}\n"),
        }
    }

    /// Decodes a response line for a request sent with `mode`.
    ///
    /// Any error line mentioning `BUSY` decodes as [`ErrorKind::Busy`], so
    /// variants like `ERROR: server BUSY` stay retryable.
    pub fn decode(line: &str, mode: Mode) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let unexpected = || ProtocolError::UnexpectedResponse(line.to_string());

        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            if rest.contains(ErrorKind::Busy.as_str()) {
                return Ok(ServerResponse::Error(ErrorKind::Busy));
            }
            let kind = rest
                .strip_prefix(':')
                .and_then(|k| ErrorKind::from_wire(k.trim()))
                .ok_or_else(unexpected)?;
            return Ok(ServerResponse::Error(kind));
        }

        let rest = line.strip_prefix(OK).ok_or_else(unexpected)?;
        match (rest.strip_prefix(FIELD_DELIMITER), mode) {
            (None, Mode::Send) if rest.is_empty() => Ok(ServerResponse::Ok),
            (Some(n), _) => {
                let n = n.trim().parse::<u64>().map_err(|_| unexpected())?;
                Ok(match mode {
                    Mode::Recv => ServerResponse::OkWithRemaining(n),
                    Mode::Send => ServerResponse::ResumeFrom(n),
                })
            }
            _ => Err(unexpected()),
        }
    }

    /// Whether the client should back off and retry the whole transfer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerResponse::Error(ErrorKind::Busy))
    }
}
