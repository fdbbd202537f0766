//! Error types shared by both ends of a transfer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the socket or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection (or it closed mid-frame).
    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame payload was not valid UTF-8 JSON, or could not be serialized.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Unexpected packet type, missing field or packet out of sequence.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("handshake failed: {message}")]
    Handshake { message: String },

    /// The peer answered with `status: ERROR`.
    #[error("rejected by peer: {message}")]
    Rejected { message: String },

    /// Signature did not verify against the peer's public key.
    #[error("authentication failed: {message}")]
    Authenticity { message: String },

    /// Recomputed digest of `iv || cipher` differs from the one sent.
    #[error("hash of part {part} does not match, data may have been altered")]
    Integrity { part: u64 },

    #[error("missing parts: expected {expected}, received {received}")]
    Incomplete { expected: u64, received: u64 },

    #[error("invalid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("crypto error: {message}")]
    Crypto { message: String },

    #[error("key error: {message}")]
    Key { message: String },

    #[error("unknown or uninitialized file id: {0}")]
    UnknownFile(String),

    #[error("server error: {message}")]
    Server { message: String },
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub fn crypto(err: impl ToString) -> Self {
        Error::Crypto {
            message: err.to_string(),
        }
    }

    pub fn key(err: impl ToString) -> Self {
        Error::Key {
            message: err.to_string(),
        }
    }

    /// Returns true if the connection itself is unusable after this error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::Timeout
                | Error::FrameTooLarge { .. }
                | Error::Codec { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
