//! Serialized access to the controller's output stream

use std::io;
use std::sync::Arc;
use tether_proto::{LineCodec, Message, ProtocolError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The controller's output stream behind a mutex.
///
/// Every write through this type is one complete message, so a relayed
/// worker line and a direct response never interleave.
#[derive(Clone)]
pub struct OutputLock {
    writer: Arc<Mutex<BoxedWriter>>,
}

impl OutputLock {
    /// Wrap a writer
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Take the stream until the returned guard is dropped
    pub async fn lock(&self) -> OutputGuard<'_> {
        OutputGuard {
            writer: self.writer.lock().await,
        }
    }

    /// Write one framed message
    pub async fn write_message(&self, codec: &LineCodec, msg: &Message) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        codec.write_message(&mut **writer, msg).await
    }
}

/// Exclusive access to the controller's output stream
pub struct OutputGuard<'a> {
    writer: MutexGuard<'a, BoxedWriter>,
}

impl OutputGuard<'_> {
    /// Write raw bytes verbatim and flush
    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }
}

impl std::fmt::Debug for OutputLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLock").finish_non_exhaustive()
    }
}
