//! Transport and protocol errors.

use std::io;

use thiserror::Error;

/// Framing error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A frame arrived but could not be understood. The connection survives.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message has no string `type` field")]
    MissingType,
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// How a failed socket read should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// Ordinary network churn. Clean up quietly.
    Benign,
    /// Worth telling the operator about.
    Unexpected,
}

impl TransportFault {
    /// Classify an I/O error from an agent socket.
    #[must_use]
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof => Self::Benign,
            _ => Self::Unexpected,
        }
    }
}
