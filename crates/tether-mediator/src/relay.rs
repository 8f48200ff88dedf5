//! Worker output relay

use crate::output::OutputLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_proto::ECHO_MARKER;
use tether_ssh::process::BoxedReader;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a worker output line is the terminal echo of a message sent to it
pub fn looks_like_echo(line: &[u8]) -> bool {
    line.starts_with(ECHO_MARKER.as_bytes())
}

/// Copies worker output lines to the controller.
///
/// While the worker is fresh, echoed input lines are dropped. The first line
/// that is not an echo ends the fresh window for good.
pub struct ResponseRelay {
    /// Worker output
    reader: BufReader<BoxedReader>,
    /// Controller output
    output: OutputLock,
    /// Freshness of the worker generation this relay belongs to
    fresh: Arc<AtomicBool>,
    /// Worker generation, for logs
    generation: Uuid,
}

impl ResponseRelay {
    /// Create a relay for one worker generation
    pub fn new(reader: BoxedReader, output: OutputLock, fresh: Arc<AtomicBool>, generation: Uuid) -> Self {
        Self {
            reader: BufReader::new(reader),
            output,
            fresh,
            generation,
        }
    }

    /// Run the relay on a background task
    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::spawn(self.run())
    }

    /// Relay until the worker output ends; returns the number of lines relayed
    pub async fn run(mut self) -> usize {
        let mut relayed = 0;
        let mut line = Vec::new();

        loop {
            line.clear();
            match self.reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    info!("Worker {} output closed", self.generation);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read output of worker {}: {}", self.generation, e);
                    break;
                }
            }

            if self.fresh.load(Ordering::SeqCst) && looks_like_echo(&line) {
                debug!("Dropping echo line from worker {}", self.generation);
                continue;
            }

            let mut output = self.output.lock().await;
            if let Err(e) = output.write_raw(&line).await {
                warn!("Controller output closed, stopping relay: {}", e);
                break;
            }
            self.fresh.store(false, Ordering::SeqCst);
            drop(output);
            relayed += 1;
        }

        relayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CaptureWriter;
    use std::io::Cursor;

    fn relay_over(input: &str, capture: &CaptureWriter) -> (ResponseRelay, Arc<AtomicBool>) {
        let fresh = Arc::new(AtomicBool::new(true));
        let relay = ResponseRelay::new(
            Box::new(Cursor::new(input.as_bytes().to_vec())),
            OutputLock::new(capture.clone()),
            fresh.clone(),
            Uuid::new_v4(),
        );
        (relay, fresh)
    }

    #[test]
    fn test_echo_heuristic() {
        assert!(looks_like_echo(b"^B{\"kind\":\"command\"}\n"));
        assert!(looks_like_echo(b"^B"));
        assert!(!looks_like_echo(b"\x02{\"kind\":\"response\"}\n"));
        assert!(!looks_like_echo(b" ^B\n"));
        assert!(!looks_like_echo(b"\n"));
    }

    #[tokio::test]
    async fn test_echo_suppressed_only_while_fresh() {
        let capture = CaptureWriter::new();
        let (relay, fresh) = relay_over("^Becho one\n^Becho two\nreal output\n^Bgenuine\n", &capture);

        let relayed = relay.run().await;

        assert_eq!(relayed, 2);
        assert_eq!(capture.contents(), "real output\n^Bgenuine\n");
        assert!(!fresh.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_echo_lines_keep_worker_fresh() {
        let capture = CaptureWriter::new();
        let (relay, fresh) = relay_over("^Bonly echo\n", &capture);

        assert_eq!(relay.run().await, 0);
        assert_eq!(capture.contents(), "");
        assert!(fresh.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lines_are_copied_verbatim() {
        let capture = CaptureWriter::new();
        let frame = "\u{2}{\"kind\":\"response\",\r\n\"command_name\":\"x\"}\r\n\r\n";
        let (relay, _) = relay_over(frame, &capture);

        assert_eq!(relay.run().await, 3);
        assert_eq!(capture.contents(), frame);
    }

    #[tokio::test]
    async fn test_fresh_cleared_while_output_is_held() {
        let capture = CaptureWriter::choppy();
        let output = OutputLock::new(capture.clone());
        let fresh = Arc::new(AtomicBool::new(true));
        let relay = ResponseRelay::new(
            Box::new(Cursor::new(b"first real line\n".to_vec())),
            output.clone(),
            fresh.clone(),
            Uuid::new_v4(),
        )
        .spawn();

        loop {
            let guard = output.lock().await;
            if !capture.contents().is_empty() {
                assert_eq!(capture.contents(), "first real line\n");
                assert!(!fresh.load(Ordering::SeqCst));
                break;
            }
            drop(guard);
            tokio::task::yield_now().await;
        }

        assert_eq!(relay.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_relayed() {
        let capture = CaptureWriter::new();
        let (relay, _) = relay_over("partial", &capture);

        assert_eq!(relay.run().await, 1);
        assert_eq!(capture.contents(), "partial");
    }
}
