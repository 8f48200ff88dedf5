//! Tether Mediator Binary
//!
//! Started by the controller with one JSON argument describing the remote
//! host. The first line of stdin is the SSH password (empty for key or agent
//! authentication); framed controller messages follow.

use anyhow::{Context, Result};
use std::sync::Arc;
use tether_mediator::{
    default_handlers, isolate_process_group, InterruptDispatcher, LaunchArgs, MediatorConfig,
    MediatorCore, OutputLock, ProcessGroupSignal, WorkerManager,
};
use tether_proto::FrameReader;
use tether_ssh::{askpass_reply, DeployOutcome, RemoteShell, SshTransport};
use tokio::io::BufReader;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // ssh runs this executable as its askpass helper
    if let Some(password) = askpass_reply() {
        println!("{}", password);
        return Ok(());
    }

    // stdout belongs to the controller
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Local interrupts go to our process group, which must not include the controller
    match isolate_process_group() {
        Ok(pgid) => info!("Running in process group {}", pgid),
        Err(e) => warn!("Could not leave the controller's process group: {}", e),
    }

    if let Err(e) = run().await {
        error!("Mediator error: {:#}", e);
        std::process::exit(1);
    }

    info!("Mediator shutting down");
    Ok(())
}

async fn run() -> Result<()> {
    let arg = std::env::args()
        .nth(1)
        .context("Missing launch argument")?;
    let args = LaunchArgs::parse(&arg)?;

    let mut input = FrameReader::new(BufReader::new(tokio::io::stdin()));
    let password = input
        .read_line()
        .await
        .context("Failed to read password line")?
        .filter(|line| !line.is_empty());

    let config = MediatorConfig::from_launch_args(args, password)?;
    watch_interrupts()?;

    let transport = Arc::new(SshTransport::new(config.ssh.clone()));
    let remote = transport.connection_info();
    info!("Starting mediator for {}@{}:{}", remote.username, remote.host, remote.port);
    let output = OutputLock::new(tokio::io::stdout());

    let workers = WorkerManager::new(transport.clone(), config.worker.clone(), output.clone());
    match workers
        .deploy_if_needed(transport.as_ref(), &config.bundle, &config.version, config.retry)
        .await?
    {
        DeployOutcome::Skipped => info!("Using existing worker deployment"),
        DeployOutcome::Uploaded { files } => info!("Uploaded {} worker files", files),
    }

    let router = default_handlers(transport.clone());
    let interrupts = InterruptDispatcher::new(transport.clone(), Arc::new(ProcessGroupSignal));
    let mut core = MediatorCore::new(workers, router, interrupts, output, config.cwd.clone());

    core.start().await?;
    core.run(&mut input).await?;
    Ok(())
}

/// Keep SIGINT sent to our own process group from terminating the mediator
#[cfg(unix)]
fn watch_interrupts() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            debug!("Received SIGINT");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn watch_interrupts() -> Result<()> {
    Ok(())
}
