//! Mediator error types

use tether_proto::ProtocolError;
use tether_ssh::TransportError;
use thiserror::Error;

/// Errors raised by the mediator
#[derive(Debug, Error)]
pub enum MediatorError {
    /// Worker code could not be deployed
    #[error("Deployment failed: {0}")]
    Deploy(#[source] TransportError),

    /// Worker process could not be started
    #[error("Failed to start worker: {0}")]
    Spawn(#[source] TransportError),

    /// No worker is running
    #[error("No worker is running")]
    NoWorker,

    /// The worker's output closed outside a restart
    #[error("Worker has exited")]
    WorkerExited,

    /// Message encoding or worker stream failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid launch configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
