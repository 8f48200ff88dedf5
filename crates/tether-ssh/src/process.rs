//! Remote process handles

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tracing::{debug, warn};

/// Writable end of a remote process's standard input
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of a remote process's standard output
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// What to run on the remote host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessSpec {
    /// Program and arguments
    pub args: Vec<String>,
    /// Remote working directory of the process
    pub cwd: Option<String>,
    /// Environment overrides
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Create a spec for `args`
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment override
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Build the command line handed to the remote shell.
    ///
    /// The launcher prints its pid on the first output line and then execs
    /// the program, so the printed pid is the program's pid.
    pub fn remote_command(&self) -> String {
        let mut script = String::from("echo $$; ");

        if let Some(cwd) = &self.cwd {
            script.push_str("cd ");
            script.push_str(&shell_quote(cwd));
            script.push_str(" && ");
        }

        script.push_str("exec ");
        if !self.env.is_empty() {
            script.push_str("env ");
            for (key, value) in &self.env {
                script.push_str(&shell_quote(&format!("{}={}", key, value)));
                script.push(' ');
            }
        }

        let args: Vec<String> = self.args.iter().map(|a| shell_quote(a)).collect();
        script.push_str(&args.join(" "));

        format!("sh -c {}", shell_quote(&script))
    }
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Lifecycle control over a running process
#[async_trait]
pub trait ProcessControl: Send {
    /// Terminate the process forcibly and reap it
    async fn kill(&mut self) -> io::Result<()>;

    /// Whether the process is still running
    fn is_alive(&mut self) -> bool;
}

#[async_trait]
impl ProcessControl for Child {
    async fn kill(&mut self) -> io::Result<()> {
        if let Err(e) = self.start_kill() {
            debug!("Process already gone before kill: {}", e);
        }

        let status = self.wait().await?;
        debug!("Process exited with status: {}", status);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!("Failed to poll process status: {}", e);
                false
            }
        }
    }
}

/// A process running on the remote host, reachable through its pipes
pub struct RemoteProcess {
    /// Standard input of the process
    stdin: Option<BoxedWriter>,
    /// Standard output of the process
    stdout: Option<BoxedReader>,
    /// Kill/liveness control
    control: Box<dyn ProcessControl>,
    /// Pid on the remote host, when known
    remote_pid: Option<u32>,
}

/// The separable pieces of a [`RemoteProcess`]
pub struct ProcessParts {
    /// Standard input of the process
    pub stdin: BoxedWriter,
    /// Standard output of the process
    pub stdout: BoxedReader,
    /// Kill/liveness control
    pub control: Box<dyn ProcessControl>,
}

impl RemoteProcess {
    /// Assemble a process handle from its pipes and control
    pub fn new(stdin: BoxedWriter, stdout: BoxedReader, control: Box<dyn ProcessControl>) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
            control,
            remote_pid: None,
        }
    }

    /// Record the pid of the process on the remote host
    pub fn with_remote_pid(mut self, pid: u32) -> Self {
        self.remote_pid = Some(pid);
        self
    }

    /// Pid of the process on the remote host
    pub fn remote_pid(&self) -> Option<u32> {
        self.remote_pid
    }

    /// Whether the process is still running
    pub fn is_alive(&mut self) -> bool {
        self.control.is_alive()
    }

    /// Terminate the process and reap it
    pub async fn kill(&mut self) -> io::Result<()> {
        self.control.kill().await
    }

    /// Split into stdin, stdout and control.
    ///
    /// Fails if one of the pipes was already detached.
    pub fn into_parts(self) -> io::Result<ProcessParts> {
        let stdin = self
            .stdin
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin already taken"))?;
        let stdout = self
            .stdout
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdout already taken"))?;

        Ok(ProcessParts {
            stdin,
            stdout,
            control: self.control,
        })
    }
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("remote_pid", &self.remote_pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .finish()
    }
}
