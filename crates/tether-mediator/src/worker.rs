//! Remote worker lifecycle

use crate::error::MediatorError;
use crate::output::OutputLock;
use crate::relay::ResponseRelay;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_proto::{LineCodec, INTERRUPT_BYTE};
use tether_ssh::process::BoxedWriter;
use tether_ssh::{
    DeployOutcome, Deployer, ProcessControl, ProcessSpec, RemoteFileTransfer, RemoteShell,
    RetryPolicy, WorkerBundle,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Python module that boots the worker
pub const DEFAULT_LAUNCHER_MODULE: &str = "tether_worker.launcher";

/// How to launch the worker on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Remote interpreter
    pub interpreter: String,
    /// Module passed to `-m`
    pub launcher_module: String,
    /// Remote directory the worker code is deployed to and run from
    pub program_dir: String,
    /// Environment overrides
    pub env: BTreeMap<String, String>,
}

impl WorkerSettings {
    /// Settings with the standard launcher and environment
    pub fn new(interpreter: impl Into<String>, program_dir: impl Into<String>) -> Self {
        let env = [
            ("TETHER_USER_DIR", "~/.config/tether"),
            ("TETHER_FRONTEND_SYS_PATH", "[]"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            interpreter: interpreter.into(),
            launcher_module: DEFAULT_LAUNCHER_MODULE.to_string(),
            program_dir: program_dir.into(),
            env,
        }
    }

    /// Process spec for a worker serving `cwd`
    pub fn process_spec(&self, cwd: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new([
            self.interpreter.as_str(),
            "-m",
            self.launcher_module.as_str(),
            cwd,
        ])
        .with_cwd(self.program_dir.clone());
        spec.env = self.env.clone();
        spec
    }
}

/// One live worker generation
struct WorkerHandle {
    /// Generation id
    id: Uuid,
    /// Worker stdin
    stdin: BoxedWriter,
    /// Kill/liveness control
    control: Box<dyn ProcessControl>,
    /// Cleared by the relay once real output was seen
    fresh: Arc<AtomicBool>,
    /// Relay task reading this generation's stdout
    relay: JoinHandle<usize>,
}

/// Owns the current worker and its relay
pub struct WorkerManager {
    shell: Arc<dyn RemoteShell>,
    settings: WorkerSettings,
    output: OutputLock,
    codec: LineCodec,
    current: Option<WorkerHandle>,
    /// Held by restarts and interrupt deliveries
    interrupt_lock: Arc<Mutex<()>>,
}

impl WorkerManager {
    /// Create a manager with no running worker
    pub fn new(shell: Arc<dyn RemoteShell>, settings: WorkerSettings, output: OutputLock) -> Self {
        Self {
            shell,
            settings,
            output,
            codec: LineCodec::new(),
            current: None,
            interrupt_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Lock serializing interrupt delivery against restarts
    pub fn interrupt_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.interrupt_lock)
    }

    /// Upload the worker code unless a usable deployment exists
    pub async fn deploy_if_needed(
        &self,
        transfer: &dyn RemoteFileTransfer,
        bundle: &WorkerBundle,
        version: &str,
        retry: RetryPolicy,
    ) -> Result<DeployOutcome, MediatorError> {
        Deployer::new(transfer, retry)
            .deploy_if_needed(bundle, &self.settings.program_dir, version)
            .await
            .map_err(MediatorError::Deploy)
    }

    /// Start a worker serving `cwd`, replacing any running one
    pub async fn start(&mut self, cwd: &str) -> Result<Uuid, MediatorError> {
        self.stop().await;

        let spec = self.settings.process_spec(cwd);
        info!("Starting worker: {:?}", spec.args);

        let process = self.shell.spawn(&spec).await.map_err(MediatorError::Spawn)?;
        let remote_pid = process.remote_pid();
        let parts = process.into_parts()?;

        let id = Uuid::new_v4();
        let fresh = Arc::new(AtomicBool::new(true));
        let relay = ResponseRelay::new(parts.stdout, self.output.clone(), Arc::clone(&fresh), id).spawn();

        info!("Worker {} started (remote pid {:?})", id, remote_pid);
        self.current = Some(WorkerHandle {
            id,
            stdin: parts.stdin,
            control: parts.control,
            fresh,
            relay,
        });
        Ok(id)
    }

    /// Replace the running worker with a fresh one serving `cwd`.
    ///
    /// When this returns, the previous worker's relay has finished, so no
    /// output of the previous worker can reach the controller anymore.
    pub async fn restart(&mut self, cwd: &str) -> Result<Uuid, MediatorError> {
        let lock = self.interrupt_lock();
        let _guard = lock.lock().await;

        info!("Restarting worker in {}", cwd);
        self.start(cwd).await
    }

    /// Kill the running worker and wait for its relay to finish
    async fn stop(&mut self) {
        let Some(mut handle) = self.current.take() else {
            return;
        };

        debug!("Stopping worker {}", handle.id);
        if let Err(e) = handle.control.kill().await {
            warn!("Failed to kill worker {}: {}", handle.id, e);
        }

        match handle.relay.await {
            Ok(lines) => debug!("Relay of worker {} finished after {} lines", handle.id, lines),
            Err(e) => warn!("Relay of worker {} failed: {}", handle.id, e),
        }
    }

    /// Send the lines of an encoded message to the running worker unchanged.
    ///
    /// Fails once the worker's output has closed; only a restart recovers.
    pub async fn forward_frame(&mut self, label: &str, frame: &str) -> Result<(), MediatorError> {
        let handle = self.current.as_mut().ok_or(MediatorError::NoWorker)?;
        if handle.relay.is_finished() {
            return Err(MediatorError::WorkerExited);
        }

        debug!("Forwarding {} to worker {}", label, handle.id);
        self.codec.write_encoded(&mut handle.stdin, frame).await?;
        Ok(())
    }

    /// Write the interrupt byte to the running worker, outside any frame
    pub async fn write_interrupt_byte(&mut self) -> Result<(), MediatorError> {
        let handle = self.current.as_mut().ok_or(MediatorError::NoWorker)?;
        handle.stdin.write_all(&[INTERRUPT_BYTE]).await?;
        handle.stdin.flush().await?;
        Ok(())
    }

    /// Whether a worker is running
    pub fn is_alive(&mut self) -> bool {
        self.current
            .as_mut()
            .is_some_and(|handle| handle.control.is_alive())
    }

    /// Id of the current worker generation
    pub fn current_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|handle| handle.id)
    }

    /// Whether the current worker has not produced real output yet
    pub fn is_fresh(&self) -> Option<bool> {
        self.current
            .as_ref()
            .map(|handle| handle.fresh.load(Ordering::SeqCst))
    }

    /// Stop the running worker
    pub async fn shutdown(&mut self) {
        info!("Shutting down worker");
        self.stop().await;
    }
}
