//! Line-oriented message codec for async streams
//!
//! A message is encoded as [`MESSAGE_MARKER`] followed by compact JSON, cut
//! into lines of at most `max_line_len` characters. On a stream every line is
//! terminated by `'\n'` and the whole frame is closed by one blank line.

use crate::ProtocolError;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// First character of every encoded message
pub const MESSAGE_MARKER: char = '\x02';

/// How a terminal renders an echoed [`MESSAGE_MARKER`]
pub const ECHO_MARKER: &str = "^B";

/// Out-of-band "abort current operation" byte understood by the worker
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Default soft cap on the length of an encoded line, in characters
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

/// Codec turning messages into marker-prefixed, size-chunked lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCodec {
    /// Maximum characters per line
    max_line_len: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a codec with the default line length
    pub fn new() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Create a codec with a custom line length
    pub fn with_max_line_len(max_line_len: usize) -> Result<Self, ProtocolError> {
        if max_line_len == 0 {
            return Err(ProtocolError::InvalidLineLength(max_line_len));
        }
        Ok(Self { max_line_len })
    }

    /// Maximum characters per encoded line
    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    /// Encode a message into its chunked textual form.
    ///
    /// The result contains `'\n'` between chunks but no trailing newline.
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(msg)?;

        let mut text = String::with_capacity(json.len() + 1);
        text.push(MESSAGE_MARKER);
        text.push_str(&json);

        Ok(self.chunk(&text).join("\n"))
    }

    /// Split `text` into lines of at most `max_line_len` characters.
    ///
    /// Existing line breaks are kept as chunk boundaries.
    pub fn chunk<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut chunks = Vec::new();
        for line in text.split('\n') {
            let mut start = 0;
            let mut count = 0;
            for (idx, _) in line.char_indices() {
                if count == self.max_line_len {
                    chunks.push(&line[start..idx]);
                    start = idx;
                    count = 0;
                }
                count += 1;
            }
            chunks.push(&line[start..]);
        }
        chunks
    }

    /// Decode a frame (the lines of one message, joined by `'\n'`)
    pub fn decode<T: DeserializeOwned>(&self, frame: &str) -> Result<T, ProtocolError> {
        let joined: String = frame
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .collect();

        let body = joined
            .strip_prefix(MESSAGE_MARKER)
            .ok_or(ProtocolError::MissingMarker)?;

        Ok(serde_json::from_str(body)?)
    }

    /// Encode a message and write it as one frame
    pub async fn write_message<W, T>(&self, writer: &mut W, msg: &T) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let encoded = self.encode(msg)?;
        self.write_encoded(writer, &encoded).await
    }

    /// Write already-encoded text as one frame, flushing after every line
    pub async fn write_encoded<W>(&self, writer: &mut W, encoded: &str) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        for line in encoded.split('\n') {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Reads blank-line terminated frames from a buffered stream
pub struct FrameReader<R> {
    /// Underlying reader
    reader: R,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Wrap a buffered reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one raw line without its terminator; `None` at end of stream
    pub async fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read the lines of the next frame, joined by `'\n'`.
    ///
    /// Returns `None` when the stream ends between frames.
    pub async fn read_frame(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut lines: Vec<String> = Vec::new();

        loop {
            match self.read_line().await? {
                None if lines.is_empty() => return Ok(None),
                None => return Err(ProtocolError::IncompleteFrame { lines: lines.len() }),
                Some(line) if line.is_empty() => {
                    if !lines.is_empty() {
                        return Ok(Some(lines.join("\n")));
                    }
                }
                Some(line) => lines.push(line),
            }
        }
    }

    /// Get the underlying reader back
    pub fn into_inner(self) -> R {
        self.reader
    }
}
