use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("iroh error: {0}")]
    Iroh(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out waiting for handshake")]
    HandshakeTimeout,

    #[error("extraction of {} failed: {source}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof | NotConnected
    )
}

impl From<iroh::endpoint::ConnectionError> for Error {
    fn from(e: iroh::endpoint::ConnectionError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<iroh::endpoint::ConnectingError> for Error {
    fn from(e: iroh::endpoint::ConnectingError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<iroh::endpoint::WriteError> for Error {
    fn from(e: iroh::endpoint::WriteError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<iroh::endpoint::ReadExactError> for Error {
    fn from(e: iroh::endpoint::ReadExactError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<iroh::endpoint::BindError> for Error {
    fn from(e: iroh::endpoint::BindError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<iroh::endpoint::ConnectError> for Error {
    fn from(e: iroh::endpoint::ConnectError) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
