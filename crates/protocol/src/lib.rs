//! Handshake codec for the parcel transfer protocol.
//!
//! Every transfer runs over one TCP connection and starts with a single
//! request line from the client and a single response line from the server.
//! Everything after the response is raw payload with no further framing.
//!
//! # Wire format
//!
//! ```text
//! REQUEST (client -> server):   MODE|OFFSET|PATH\n
//!                               MODE   = SEND | RECV
//!                               OFFSET = decimal byte offset
//!                               PATH   = remote-relative path, no '|'
//!
//! RESPONSE (server -> client):  OK\n                (SEND accepted)
//!                               OK|<n>\n            (RECV: n bytes follow,
//!                                                    SEND: resume from n)
//!                               ERROR:<KIND>\n      (INVALID, NOT_FOUND, IO,
//!                                                    MODE, BUSY)
//! ```
//!
//! See [`wire`] for the async line reader/writer.

pub mod request;
pub mod response;
pub mod wire;

pub use request::{Mode, RequestError, TransferRequest};
pub use response::{ErrorKind, ServerResponse};

/// Default server port.
pub const DEFAULT_PORT: u16 = 8190;

/// Upper bound for a handshake line, newline included.
pub const MAX_HANDSHAKE_LEN: usize = 2048;

/// Field delimiter inside handshake lines.
pub const FIELD_DELIMITER: char = '|';

/// Errors produced while exchanging handshake lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before the handshake line")]
    ConnectionClosed,

    #[error("handshake line exceeds {MAX_HANDSHAKE_LEN} bytes")]
    LineTooLong,

    #[error("handshake line is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),
}
