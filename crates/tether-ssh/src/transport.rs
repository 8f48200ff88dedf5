//! Remote shell abstraction and the OpenSSH implementation

use crate::process::{ProcessControl, ProcessSpec, RemoteProcess};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Environment variable carrying the password to the askpass helper
pub const ASKPASS_PASSWORD_ENV: &str = "TETHER_ASKPASS_PASSWORD";

/// Exit status the ssh client uses for its own failures
const SSH_CLIENT_FAILURE: i32 = 255;

/// Remote shell session able to run processes on a host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Start a process with piped stdin/stdout
    async fn spawn(&self, spec: &ProcessSpec) -> Result<RemoteProcess, TransportError>;

    /// Deliver an interrupt through the session's own mechanism
    async fn interrupt(&self) -> Result<(), TransportError>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
}

/// SSH configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password; key or agent authentication is used when absent
    pub password: Option<String>,
    /// SSH key path
    pub key_path: Option<PathBuf>,
    /// SSH options
    pub options: HashMap<String, String>,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Command timeout in seconds
    pub command_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_path: None,
            options: HashMap::new(),
            connect_timeout: 30,
            command_timeout: 300,
        }
    }
}

/// Output of a one-shot remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    /// Standard output
    pub stdout: Bytes,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Remote shell session driving the system `ssh` client.
///
/// Clones share the remembered remote pid.
#[derive(Debug, Clone)]
pub struct SshTransport {
    /// SSH configuration
    config: SshConfig,
    /// The ssh client executable
    ssh_program: PathBuf,
    /// Program ssh runs to obtain the password
    askpass_program: Option<PathBuf>,
    /// Remote pid of the most recently spawned process
    last_remote_pid: Arc<Mutex<Option<u32>>>,
}

impl SshTransport {
    /// Create a new transport; the current executable answers password prompts
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            ssh_program: PathBuf::from("ssh"),
            askpass_program: std::env::current_exe().ok(),
            last_remote_pid: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a different ssh client executable
    pub fn with_ssh_program(mut self, program: PathBuf) -> Self {
        self.ssh_program = program;
        self
    }

    /// Use a different program as the askpass helper
    pub fn with_askpass_program(mut self, program: PathBuf) -> Self {
        self.askpass_program = Some(program);
        self
    }

    /// Get the SSH configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Build SSH command arguments
    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(), "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(), format!("ConnectTimeout={}", self.config.connect_timeout),
            "-p".to_string(), self.config.port.to_string(),
        ];

        // Without a password there is nobody to answer prompts
        if self.config.password.is_none() {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }

        // Add SSH key if specified
        if let Some(key_path) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
        }

        // Add custom options
        for (key, value) in &self.config.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Add target
        args.push(format!("{}@{}", self.config.username, self.config.host));

        args
    }

    /// Build an `ssh` invocation running `remote_command`
    fn ssh_command(&self, remote_command: &str) -> Result<Command, TransportError> {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(self.build_ssh_args()).arg(remote_command);

        if let Some(password) = &self.config.password {
            let askpass = self.askpass_program.as_ref().ok_or_else(|| {
                TransportError::Configuration("No askpass program for password authentication".to_string())
            })?;
            cmd.env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(ASKPASS_PASSWORD_ENV, password);
        }

        // Local interrupts target the mediator's own process group only
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    /// Execute a command over SSH, optionally feeding `input` to its stdin
    pub async fn execute_command(
        &self,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        debug!("Executing SSH command: {}", command);

        let mut cmd = self.ssh_command(command)?;
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Connection(format!("Failed to execute SSH: {}", e)))?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }

        let limit = Duration::from_secs(self.config.command_timeout);
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout)??;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: Bytes::from(output.stdout),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if result.code == Some(SSH_CLIENT_FAILURE) {
            return Err(TransportError::Connection(format!("SSH command failed: {}", result.stderr)));
        }

        Ok(result)
    }

    /// Execute a command and require a zero exit status
    pub async fn execute_checked(
        &self,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<Bytes, TransportError> {
        let output = self.execute_command(command, input).await?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                code: output.code.unwrap_or(-1),
                message: output.stderr,
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteShell for SshTransport {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<RemoteProcess, TransportError> {
        info!(
            "Starting remote process on {}@{}: {:?}",
            self.config.username, self.config.host, spec.args
        );

        let mut cmd = self.ssh_command(&spec.remote_command())?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("Failed to start SSH: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("SSH stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("SSH stdout not captured".to_string()))?;

        // The first line is the remote pid printed by the launch script
        let mut reader = BufReader::new(stdout);
        let mut first_line = String::new();
        let limit = Duration::from_secs(self.config.connect_timeout);
        let n = timeout(limit, reader.read_line(&mut first_line))
            .await
            .map_err(|_| TransportError::Timeout)??;
        if n == 0 {
            return Err(TransportError::Spawn(
                "Remote process exited before reporting its pid".to_string(),
            ));
        }

        let pid: u32 = first_line.trim().parse().map_err(|_| {
            TransportError::Protocol(format!("Expected remote pid, got {:?}", first_line.trim()))
        })?;

        *self
            .last_remote_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pid);

        debug!("Remote process started with pid {}", pid);
        let control = SshProcessControl {
            child,
            remote_pid: pid,
            transport: self.clone(),
        };
        Ok(RemoteProcess::new(Box::new(stdin), Box::new(reader), Box::new(control)).with_remote_pid(pid))
    }

    async fn interrupt(&self) -> Result<(), TransportError> {
        let pid = *self
            .last_remote_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match pid {
            Some(pid) => {
                debug!("Sending SIGINT to remote pid {}", pid);
                self.execute_checked(&format!("kill -INT {}", pid), None).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
        }
    }
}

/// An ssh client together with the remote process it started.
///
/// sshd leaves the remote command running when a pty-less client goes away,
/// so killing only the local client is not enough.
struct SshProcessControl {
    /// Local ssh client
    child: Child,
    /// Pid of the remote command
    remote_pid: u32,
    /// Session used to reach the host again
    transport: SshTransport,
}

#[async_trait]
impl ProcessControl for SshProcessControl {
    async fn kill(&mut self) -> io::Result<()> {
        debug!("Killing remote pid {}", self.remote_pid);
        let command = format!("kill -KILL {}", self.remote_pid);
        match self.transport.execute_checked(&command, None).await {
            Ok(_) => {}
            Err(TransportError::CommandFailed { message, .. }) => {
                debug!("Remote pid {} already gone: {}", self.remote_pid, message);
            }
            Err(e) => warn!("Failed to kill remote pid {}: {}", self.remote_pid, e),
        }

        ProcessControl::kill(&mut self.child).await
    }

    fn is_alive(&mut self) -> bool {
        self.child.is_alive()
    }
}

/// Password to print when this process was started as an ssh askpass helper
pub fn askpass_reply() -> Option<String> {
    std::env::var(ASKPASS_PASSWORD_ENV).ok()
}
