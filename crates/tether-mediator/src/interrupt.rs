//! Interrupt delivery to the local process group and the remote worker

use crate::worker::WorkerManager;
use std::io;
use std::sync::Arc;
use tether_ssh::RemoteShell;
use tracing::{debug, warn};

/// Delivers an interrupt to local computations
pub trait LocalSignal: Send + Sync {
    /// Interrupt whatever runs locally
    fn interrupt(&self) -> io::Result<()>;
}

/// Sends SIGINT to the mediator's own process group
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupSignal;

#[cfg(unix)]
impl LocalSignal for ProcessGroupSignal {
    fn interrupt(&self) -> io::Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::getpgrp;

        killpg(getpgrp(), Signal::SIGINT).map_err(io::Error::from)
    }
}

#[cfg(not(unix))]
impl LocalSignal for ProcessGroupSignal {
    fn interrupt(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Make the mediator the leader of its own process group; returns the group id.
///
/// [`ProcessGroupSignal`] interrupts the whole group, which otherwise also
/// contains the controller that started the mediator.
#[cfg(unix)]
pub fn isolate_process_group() -> io::Result<u32> {
    use nix::unistd::{getpgrp, getpid, setpgid, Pid};

    if getpgrp() != getpid() {
        setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;
    }
    Ok(getpgrp().as_raw() as u32)
}

/// The mediator's own pid; process groups are a unix notion
#[cfg(not(unix))]
pub fn isolate_process_group() -> io::Result<u32> {
    Ok(std::process::id())
}

/// Interrupts both the local and the remote side
pub struct InterruptDispatcher {
    shell: Arc<dyn RemoteShell>,
    local: Arc<dyn LocalSignal>,
}

impl InterruptDispatcher {
    /// Create a dispatcher
    pub fn new(shell: Arc<dyn RemoteShell>, local: Arc<dyn LocalSignal>) -> Self {
        Self { shell, local }
    }

    /// Deliver an interrupt everywhere, best effort.
    ///
    /// The remote interrupt runs on its own task and is not awaited. Each
    /// delivery is attempted even when another one fails.
    pub async fn dispatch(&self, workers: &mut WorkerManager) {
        debug!("Dispatching interrupt");

        let shell = Arc::clone(&self.shell);
        tokio::spawn(async move {
            if let Err(e) = shell.interrupt().await {
                warn!("Remote interrupt failed: {}", e);
            }
        });

        let lock = workers.interrupt_lock();
        let _guard = lock.lock().await;

        if let Err(e) = self.local.interrupt() {
            warn!("Local interrupt failed: {}", e);
        }

        if let Err(e) = workers.write_interrupt_byte().await {
            warn!("Could not send interrupt byte to worker: {}", e);
        }
    }
}
