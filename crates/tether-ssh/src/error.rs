//! SSH-specific error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Worker deployment error
    #[error("Deployment error: {0}")]
    Deploy(String),

    /// Remote process could not be started
    #[error("Failed to spawn remote process: {0}")]
    Spawn(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Unexpected output from a remote command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote command failed
    #[error("Remote command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed command
        code: i32,
        /// Error message
        message: String,
    },
}

impl TransportError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::Timeout)
    }
}
