//! Output capture for mediator tests

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tether_proto::{LineCodec, Message};
use tokio::io::AsyncWrite;

/// An [`AsyncWrite`] collecting everything written into a shared buffer
#[derive(Clone, Default)]
pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
    /// Accept at most a few bytes per call and yield in between
    choppy: bool,
    yielded: Arc<AtomicBool>,
}

impl CaptureWriter {
    /// Create a writer accepting whole buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer that accepts small pieces and yields between them
    pub fn choppy() -> Self {
        Self {
            choppy: true,
            ..Self::default()
        }
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Decode every complete frame written so far
    pub fn messages(&self) -> Vec<Message> {
        let codec = LineCodec::new();
        self.contents()
            .split("\n\n")
            .filter(|frame| !frame.trim().is_empty())
            .filter_map(|frame| codec.decode(frame).ok())
            .collect()
    }
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let len = if self.choppy {
            if !self.yielded.swap(true, Ordering::SeqCst) {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.yielded.store(false, Ordering::SeqCst);
            buf.len().min(7)
        } else {
            buf.len()
        };

        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&buf[..len]);
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
