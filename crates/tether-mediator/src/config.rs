//! Launch configuration

use crate::error::MediatorError;
use crate::worker::WorkerSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tether_ssh::{deployment_dir, RetryPolicy, SshConfig, WorkerBundle};

/// Tool name used in the remote deployment directory
pub const TOOL_NAME: &str = "tether";

/// Version deployed when the launch arguments name none
pub const DEFAULT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The single JSON argument the mediator is started with
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchArgs {
    /// Remote host
    pub host: String,
    /// Remote user
    pub user: String,
    /// Remote interpreter
    pub interpreter: String,
    /// Initial working directory of the worker
    pub cwd: String,
    /// SSH port
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key file
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Extra `ssh -o` options
    #[serde(default)]
    pub ssh_options: HashMap<String, String>,
    /// Local directory holding the worker bundle
    #[serde(default)]
    pub worker_source: Option<PathBuf>,
    /// Version to deploy
    #[serde(default)]
    pub version: Option<String>,
}

impl LaunchArgs {
    /// Parse the launch argument
    pub fn parse(arg: &str) -> Result<Self, MediatorError> {
        let args: Self = serde_json::from_str(arg)
            .map_err(|e| MediatorError::Config(format!("Invalid launch arguments: {}", e)))?;

        for (field, value) in [
            ("host", &args.host),
            ("user", &args.user),
            ("interpreter", &args.interpreter),
            ("cwd", &args.cwd),
        ] {
            if value.trim().is_empty() {
                return Err(MediatorError::Config(format!("Launch argument {} is empty", field)));
            }
        }

        Ok(args)
    }
}

/// Everything the mediator needs to run
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// SSH connection
    pub ssh: SshConfig,
    /// Worker launch settings
    pub worker: WorkerSettings,
    /// Worker files to deploy
    pub bundle: WorkerBundle,
    /// Retry policy for file transfers
    pub retry: RetryPolicy,
    /// Deployed version
    pub version: String,
    /// Initial working directory of the worker
    pub cwd: String,
}

impl MediatorConfig {
    /// Derive the configuration from launch arguments and the ssh password
    pub fn from_launch_args(args: LaunchArgs, password: Option<String>) -> Result<Self, MediatorError> {
        let version = args.version.unwrap_or_else(|| DEFAULT_VERSION.to_string());

        let worker_source = match args.worker_source {
            Some(path) => path,
            None => default_worker_source().ok_or_else(|| {
                MediatorError::Config("Cannot locate the worker source directory".to_string())
            })?,
        };

        let ssh = SshConfig {
            host: args.host,
            port: args.port.unwrap_or(22),
            username: args.user.clone(),
            password,
            key_path: args.key_path,
            options: args.ssh_options,
            ..Default::default()
        };

        let program_dir = deployment_dir(TOOL_NAME, &version, &args.user);

        Ok(Self {
            ssh,
            worker: WorkerSettings::new(args.interpreter, program_dir),
            bundle: WorkerBundle::standard(worker_source),
            retry: RetryPolicy::default(),
            version,
            cwd: args.cwd,
        })
    }
}

/// `worker` next to the running executable
fn default_worker_source() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(|dir| dir.join("worker"))
}
