//! # Tether Protocol
//!
//! Message types and the line-oriented codec spoken between the controller,
//! the mediator and the remote worker.

#![warn(missing_docs)]

/// Message types exchanged with the controller and the worker
pub mod message;

/// Line-oriented message codec and frame reader
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{
    FrameReader, LineCodec, DEFAULT_MAX_LINE_LEN, ECHO_MARKER, INTERRUPT_BYTE, MESSAGE_MARKER,
};
pub use error::ProtocolError;
pub use message::{Command, Incoming, Message, Response};
