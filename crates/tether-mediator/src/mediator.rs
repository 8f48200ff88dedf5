//! Mediator main loop

use crate::error::MediatorError;
use crate::interrupt::InterruptDispatcher;
use crate::output::OutputLock;
use crate::router::{invoke, CommandRouter, Target};
use crate::worker::WorkerManager;
use tether_proto::{Command, FrameReader, Incoming, LineCodec, Message, ProtocolError};
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info, warn};

/// Name of the immediate command requesting an interrupt
pub const INTERRUPT_COMMAND: &str = "interrupt";

/// Dispatches controller messages to local handlers and the worker
pub struct MediatorCore {
    workers: WorkerManager,
    router: CommandRouter,
    interrupts: InterruptDispatcher,
    output: OutputLock,
    codec: LineCodec,
    /// Working directory the worker serves
    cwd: String,
}

impl MediatorCore {
    /// Assemble a mediator
    pub fn new(
        workers: WorkerManager,
        router: CommandRouter,
        interrupts: InterruptDispatcher,
        output: OutputLock,
        cwd: impl Into<String>,
    ) -> Self {
        Self {
            workers,
            router,
            interrupts,
            output,
            codec: LineCodec::new(),
            cwd: cwd.into(),
        }
    }

    /// Working directory the worker serves
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Start the first worker
    pub async fn start(&mut self) -> Result<(), MediatorError> {
        self.workers.start(&self.cwd).await?;
        Ok(())
    }

    /// Process controller messages until the controller closes its stream.
    ///
    /// Returns an error only when the mediator cannot continue.
    pub async fn run<R>(&mut self, input: &mut FrameReader<R>) -> Result<(), MediatorError>
    where
        R: AsyncBufRead + Unpin,
    {
        info!("Mediator ready");
        let result = self.process(input).await;
        self.workers.shutdown().await;
        result
    }

    async fn process<R>(&mut self, input: &mut FrameReader<R>) -> Result<(), MediatorError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let frame = match input.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Controller closed its stream");
                    return Ok(());
                }
                Err(ProtocolError::IncompleteFrame { lines }) => {
                    warn!("Controller stream ended inside a frame ({} lines)", lines);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.handle_frame(&frame).await?;
        }
    }

    /// Handle one controller frame.
    ///
    /// Whatever reaches the worker is `frame` itself, line for line.
    pub async fn handle_frame(&mut self, frame: &str) -> Result<(), MediatorError> {
        let msg = match self.codec.decode::<Incoming>(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Discarding undecodable message: {}", e);
                return self
                    .send_message(&Message::error(format!("Invalid message: {}", e)))
                    .await;
            }
        };
        debug!("Handling {}", msg.label());

        match msg {
            Incoming::Command(cmd) => self.handle_command(cmd, frame).await,
            Incoming::Immediate(cmd) if cmd.name == INTERRUPT_COMMAND => {
                self.interrupts.dispatch(&mut self.workers).await;
                Ok(())
            }
            other => self.forward(other.label(), frame).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command, frame: &str) -> Result<(), MediatorError> {
        let route = self.router.route(&cmd);

        if route.restart {
            if let Some(cwd) = cmd.expected_cwd() {
                self.cwd = cwd.to_string();
            }
            self.workers.restart(&self.cwd).await?;
        }

        match route.target {
            Target::Local(handler) => {
                let response = invoke(handler.as_ref(), &cmd).await;
                self.send_message(&Message::response(response)).await
            }
            Target::Worker => self.forward(&cmd.name, frame).await,
        }
    }

    async fn forward(&mut self, label: &str, frame: &str) -> Result<(), MediatorError> {
        match self.workers.forward_frame(label, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Cannot deliver {} to worker: {}", label, e);
                self.send_message(&Message::error(format!(
                    "Cannot deliver {} to worker: {}",
                    label, e
                )))
                .await
            }
        }
    }

    /// Write a message to the controller
    pub async fn send_message(&mut self, msg: &Message) -> Result<(), MediatorError> {
        self.output.write_message(&self.codec, msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::LocalSignal;
    use crate::test_utils::CaptureWriter;
    use crate::worker::WorkerSettings;
    use std::io::{self, Cursor};
    use std::sync::Arc;
    use tether_proto::Response;
    use tether_ssh::test_utils::MockShell;
    use tokio::io::BufReader;

    struct NoSignal;

    impl LocalSignal for NoSignal {
        fn interrupt(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn core(shell: &Arc<MockShell>, capture: &CaptureWriter) -> MediatorCore {
        let output = OutputLock::new(capture.clone());
        let workers = WorkerManager::new(
            shell.clone(),
            WorkerSettings::new("python3", "/tmp/tether-backend-0.1.0-bob"),
            output.clone(),
        );
        let interrupts = InterruptDispatcher::new(shell.clone(), Arc::new(NoSignal));
        MediatorCore::new(workers, CommandRouter::new(), interrupts, output, "/home/bob")
    }

    async fn handle(core: &mut MediatorCore, msg: Incoming) {
        let frame = LineCodec::new().encode(&msg).unwrap();
        core.handle_frame(&frame).await.unwrap();
    }

    fn input(messages: &[Incoming]) -> FrameReader<BufReader<Cursor<Vec<u8>>>> {
        let codec = LineCodec::new();
        let mut data = String::new();
        for msg in messages {
            data.push_str(&codec.encode(msg).unwrap());
            data.push_str("\n\n");
        }
        FrameReader::new(BufReader::new(Cursor::new(data.into_bytes())))
    }

    #[tokio::test]
    async fn test_expected_cwd_is_adopted_on_restart() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();

        let cmd = Command::new("Execute").with_field("expected_cwd", "/proj");
        handle(&mut core, Incoming::Command(cmd)).await;

        assert_eq!(core.cwd(), "/proj");
        assert_eq!(shell.spawn_count(), 2);
        assert_eq!(shell.spawned_specs()[1].args.last().map(String::as_str), Some("/proj"));
    }

    #[tokio::test]
    async fn test_restart_without_expected_cwd_keeps_cwd() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();

        handle(&mut core, Incoming::Command(Command::new("Run"))).await;

        assert_eq!(core.cwd(), "/home/bob");
        assert_eq!(shell.spawned_specs()[1].args.last().map(String::as_str), Some("/home/bob"));
    }

    #[tokio::test]
    async fn test_undecodable_frame_reports_error_and_continues() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();
        let mut worker = shell.take_worker(0).unwrap();

        let data = "\u{2}{\"kind\":\"bogus\"}\n\n\u{2}{\"kind\":\"eof\"}\n\n";
        let mut reader = FrameReader::new(BufReader::new(Cursor::new(data.as_bytes().to_vec())));
        core.run(&mut reader).await.unwrap();

        let messages = capture.messages();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::Error { message } if message.starts_with("Invalid message")));

        let lines = worker.read_frame_lines().await.unwrap();
        let forwarded: Incoming = LineCodec::new().decode(&lines.join("\n")).unwrap();
        assert_eq!(forwarded, Incoming::Eof);
        assert!(worker.is_killed());
    }

    #[tokio::test]
    async fn test_pass_through_frames_reach_worker_unchanged() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();
        let mut worker = shell.take_worker(0).unwrap();

        let first = "\u{2}{\"kind\":\"command\",\"name\":\"run\",\"zeta\":1,";
        let second = "\"big\":123456789012345678901234567890,\"ratio\":0.1e1}";
        let data = format!("{}\r\n{}\r\n\r\n\u{2}{{\"kind\":\"input\",  \"data\":\"1e2\"}}\n\n", first, second);
        let mut reader = FrameReader::new(BufReader::new(Cursor::new(data.into_bytes())));
        core.run(&mut reader).await.unwrap();

        assert_eq!(worker.read_frame_lines().await.unwrap(), vec![first, second]);
        assert_eq!(
            worker.read_frame_lines().await.unwrap(),
            vec!["\u{2}{\"kind\":\"input\",  \"data\":\"1e2\"}"]
        );
        assert!(capture.contents().is_empty());
    }

    #[tokio::test]
    async fn test_forward_without_worker_reports_error() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);

        handle(&mut core, Incoming::Input { data: "42\n".to_string() }).await;

        let messages = capture.messages();
        assert_eq!(
            messages,
            vec![Message::error("Cannot deliver <input> to worker: No worker is running")]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_on_restart_is_fatal() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();
        shell.set_fail_spawn(true);

        let mut reader = input(&[Incoming::Command(Command::new("Execute"))]);
        let result = core.run(&mut reader).await;

        assert!(matches!(result, Err(MediatorError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_other_immediate_commands_are_forwarded() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();
        let mut worker = shell.take_worker(0).unwrap();

        let msg = Incoming::Immediate(Command::new("get_globals"));
        handle(&mut core, msg.clone()).await;

        let lines = worker.read_frame_lines().await.unwrap();
        assert_eq!(LineCodec::new().decode::<Incoming>(&lines.join("\n")).unwrap(), msg);
        assert_eq!(shell.interrupt_count(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_command_is_not_forwarded() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);
        core.start().await.unwrap();
        let mut worker = shell.take_worker(0).unwrap();

        handle(&mut core, Incoming::Immediate(Command::new(INTERRUPT_COMMAND))).await;

        assert_eq!(worker.read_byte().await.unwrap(), tether_proto::INTERRUPT_BYTE);
        tokio::time::timeout(std::time::Duration::from_secs(5), shell.wait_for_interrupts(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_message_is_framed() {
        let shell = Arc::new(MockShell::new());
        let capture = CaptureWriter::new();
        let mut core = core(&shell, &capture);

        let resp = Response::error(&Command::new("stat_path"), "boom");
        core.send_message(&Message::response(resp.clone())).await.unwrap();

        assert!(capture.contents().ends_with("\n\n"));
        assert_eq!(capture.messages(), vec![Message::response(resp)]);
    }
}
