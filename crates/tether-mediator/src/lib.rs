//! # Tether Mediator
//!
//! Presents a worker running on a remote host to a local controller. The
//! mediator deploys and starts the worker over SSH, routes controller commands
//! to local handlers or to the worker, relays worker output back, and delivers
//! interrupts to both sides.

#![warn(missing_docs)]

/// Launch configuration
pub mod config;

/// Mediator error types
pub mod error;

/// File system commands answered by the mediator itself
pub mod handlers;

/// Interrupt delivery
pub mod interrupt;

/// Mediator main loop
pub mod mediator;

/// Serialized access to the controller's output stream
pub mod output;

/// Worker output relay
pub mod relay;

/// Command classification and local handler dispatch
pub mod router;

/// Remote worker lifecycle
pub mod worker;

/// Output capture for tests
pub mod test_utils;

pub use config::{LaunchArgs, MediatorConfig};
pub use error::MediatorError;
pub use handlers::default_handlers;
pub use interrupt::{isolate_process_group, InterruptDispatcher, LocalSignal, ProcessGroupSignal};
pub use mediator::MediatorCore;
pub use output::OutputLock;
pub use relay::{looks_like_echo, ResponseRelay};
pub use router::{CommandRouter, LocalHandler, Route, Target};
pub use worker::{WorkerManager, WorkerSettings};
