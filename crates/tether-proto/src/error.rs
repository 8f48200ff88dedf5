//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame does not start with the message marker
    #[error("Frame is missing the message marker")]
    MissingMarker,

    /// Stream ended in the middle of a frame
    #[error("Stream ended inside a frame ({lines} lines pending)")]
    IncompleteFrame {
        /// Number of lines read before the stream ended
        lines: usize,
    },

    /// Invalid chunk size configuration
    #[error("Invalid maximum line length: {0}")]
    InvalidLineLength(usize),

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
