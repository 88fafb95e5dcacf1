//! Request line: `MODE|OFFSET|PATH`.

use std::fmt;
use std::str::FromStr;

use crate::FIELD_DELIMITER;
use crate::response::ErrorKind;

/// Direction of the payload, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The server receives file contents (client upload).
    Send,
    /// The server sends file contents (client download).
    Recv,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Send => "SEND",
            Mode::Recv => "RECV",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEND" => Ok(Mode::Send),
            "RECV" => Ok(Mode::Recv),
            other => Err(RequestError::UnknownMode(other.to_string())),
        }
    }
}

/// Why a request line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("expected 3 fields, got {0}")]
    FieldCount(usize),

    #[error("empty {0} field")]
    EmptyField(&'static str),

    #[error("unknown mode: {0:?}")]
    UnknownMode(String),

    #[error("invalid offset: {0:?}")]
    InvalidOffset(String),

    #[error("path contains a delimiter or line break: {0:?}")]
    InvalidPath(String),
}

impl RequestError {
    /// The error kind reported back to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::UnknownMode(_) => ErrorKind::Mode,
            _ => ErrorKind::Invalid,
        }
    }
}

/// A parsed transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub mode: Mode,
    /// Byte offset the client wants to resume from.
    pub offset: u64,
    /// Remote path, relative to the server root.
    pub path: String,
}

impl TransferRequest {
    /// Builds a request, rejecting paths that cannot be framed on one line.
    pub fn new(mode: Mode, offset: u64, path: impl Into<String>) -> Result<Self, RequestError> {
        let path = path.into();
        if path.is_empty() {
            return Err(RequestError::EmptyField("path"));
        }
        if path.contains(FIELD_DELIMITER) || path.contains(['\n', '\r']) {
            return Err(RequestError::InvalidPath(path));
        }
        Ok(Self { mode, offset, path })
    }

    /// Parses a request line. Trailing line terminators are ignored.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        let [mode, offset, path] = fields.as_slice() else {
            return Err(RequestError::FieldCount(fields.len()));
        };

        if mode.is_empty() {
            return Err(RequestError::EmptyField("mode"));
        }
        if offset.is_empty() {
            return Err(RequestError::EmptyField("offset"));
        }
        if path.is_empty() {
            return Err(RequestError::EmptyField("path"));
        }

        let mode: Mode = mode.parse()?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| RequestError::InvalidOffset(offset.to_string()))?;

        Ok(Self {
            mode,
            offset,
            path: path.to_string(),
        })
    }

    /// Encodes the request as a newline-terminated line.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}",
            self.mode, self.offset, self.path
        )
    }
}
