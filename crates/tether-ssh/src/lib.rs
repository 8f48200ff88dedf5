//! # Tether SSH Transport
//!
//! Remote shell sessions, file transfer and worker deployment over the
//! system OpenSSH client.

#![warn(missing_docs)]

/// Remote shell abstraction and the OpenSSH implementation
pub mod transport;

/// Remote process handles
pub mod process;

/// Remote file transfer operations
pub mod transfer;

/// Retry policy for transient failures
pub mod retry;

/// Worker code deployment
pub mod deploy;

/// SSH-specific error types
pub mod error;

/// In-memory shell and file transfer doubles for tests
pub mod test_utils;

pub use deploy::{deployment_dir, is_development_version, DeployOutcome, Deployer, WorkerBundle};
pub use error::TransportError;
pub use process::{shell_quote, ProcessControl, ProcessSpec, RemoteProcess};
pub use retry::RetryPolicy;
pub use transfer::{DirEntry, FileKind, FileStat, RemoteFileTransfer};
pub use transport::{
    askpass_reply, ConnectionInfo, RemoteShell, SshConfig, SshTransport, ASKPASS_PASSWORD_ENV,
};
