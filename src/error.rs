//! Error taxonomy for the relay.
//!
//! Generalizes the teacher crate's `Error`/`ErrorKind` split (a kind for
//! branching logic, plus context for diagnostics) onto the five kinds this
//! relay actually produces: a malformed wire frame is fatal to the
//! connection but never escapes to the broker, a bad message body is
//! recoverable per-message, and so on.

use std::io;

use thiserror::Error;

/// Malformed wire data: bad framing, unknown command, oversize frame,
/// a broken header escape sequence. Fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("frame header section exceeds the {limit} byte limit")]
    HeaderTooLarge { limit: usize },
    #[error("frame body exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },
    #[error("malformed header escape sequence in {header:?}")]
    BadEscape { header: String },
    #[error("missing NUL terminator after content-length body")]
    MissingTerminator,
    #[error("invalid content-length header: {0}")]
    BadContentLength(String),
    #[error("frame is missing a required header: {0}")]
    MissingHeader(&'static str),
    #[error("unexpected STOMP command in this state: {0}")]
    UnexpectedCommand(String),
    #[error("malformed heart-beat header: {0}")]
    BadHeartBeat(String),
    #[error("unsupported STOMP version: {0}")]
    UnsupportedVersion(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A message translation failure, recoverable on a per-message basis.
#[derive(Debug, Error, Clone)]
pub enum ProcessingError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("invalid message type: {0}")]
    InvalidMessageType(String),
    #[error("UTF-8 decode error")]
    Utf8,
    #[error("invalid {0} message: {1}")]
    SchemaValidation(String, String),
    #[error("invalid creditor ID: {0}")]
    InvalidCreditorId(String),
    #[error("invalid debtor ID: {0}")]
    InvalidDebtorId(String),
    #[error("invalid coordinator type: {0}")]
    InvalidCoordinatorType(String),
    #[error("subnets with unequal masks cannot be rewritten between")]
    SubnetMaskMismatch,
    #[error("routing key argument out of i64 range")]
    RoutingKeyOverflow,
}

/// A terminal, connection-ending error to be surfaced to the peer as a
/// STOMP `ERROR` frame.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
    /// `receipt-id` of the offending frame/message, if known.
    pub receipt_id: Option<String>,
    /// Original message body, kept as context for the `ERROR` frame.
    pub context: Option<Vec<u8>>,
    pub context_type: Option<String>,
    pub context_content_type: Option<String>,
}

impl ServerError {
    pub fn simple(message: impl Into<String>) -> Self {
        ServerError {
            message: message.into(),
            receipt_id: None,
            context: None,
            context_type: None,
            context_content_type: None,
        }
    }
}

impl From<ProcessingError> for ServerError {
    fn from(e: ProcessingError) -> Self {
        ServerError::simple(e.to_string())
    }
}

/// Heartbeat or handshake timer expiry. Fatal to the connection.
#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("no CONNECTED frame received within {0:?}")]
    Handshake(std::time::Duration),
    #[error("no data received from peer within {0:?}")]
    Heartbeat(std::time::Duration),
    #[error("TLS handshake did not complete within {0:?}")]
    TlsHandshake(std::time::Duration),
}

/// Bootstrap failure reading `NodeInfo`/`PeerInfo` from the on-disk
/// directory tree. Fatal to the process.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed entry at {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("unsupported database URL: {0}")]
    UnsupportedUrl(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

/// Top-level error for any operation that can fail for more than one
/// reason, uniting the five kinds above the way the teacher's
/// `Error`/`ErrorKind` pair does, but as plain enum variants rather than
/// a boxed-any payload, since every producer here is known at compile
/// time.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
