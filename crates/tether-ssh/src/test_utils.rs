//! In-memory shell and file transfer doubles for tests

use crate::process::{ProcessControl, ProcessSpec, RemoteProcess};
use crate::transfer::{DirEntry, FileKind, FileStat, RemoteFileTransfer};
use crate::transport::{ConnectionInfo, RemoteShell};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Pipe capacity of mock worker streams
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pid reported by the first mock worker
const FIRST_MOCK_PID: u32 = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-side output pipe, shared with the process control so kill closes it
type SharedWriter = Arc<tokio::sync::Mutex<Option<DuplexStream>>>;

/// The far end of a process started by [`MockShell`]
pub struct MockWorker {
    /// What the mediator wrote to the process
    stdin: BufReader<DuplexStream>,
    /// Where the process output goes
    stdout: SharedWriter,
    /// Set once the process was killed
    killed: Arc<AtomicBool>,
    /// Spec the process was started with
    spec: ProcessSpec,
}

impl MockWorker {
    /// Emit one output line
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.stdout.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker output closed"))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    /// Read one input line without its terminator; `None` once input is closed
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.stdin.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read the lines of one blank-line terminated frame
    pub async fn read_frame_lines(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line().await? {
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }

    /// Read a single raw input byte
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.stdin.read_u8().await
    }

    /// Close both pipes, as a crashing process would
    pub async fn close(self) {
        self.stdout.lock().await.take();
    }

    /// Whether the process was killed
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Spec the process was started with
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

/// Kill switch for a [`MockWorker`]
struct MockControl {
    stdout: SharedWriter,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessControl for MockControl {
    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.stdout.lock().await.take();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.killed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ShellState {
    specs: Vec<ProcessSpec>,
    workers: Vec<Option<MockWorker>>,
}

/// [`RemoteShell`] whose processes are in-memory pipes
#[derive(Default)]
pub struct MockShell {
    state: Mutex<ShellState>,
    fail_spawn: AtomicBool,
    fail_interrupt: AtomicBool,
    stall_interrupt: AtomicBool,
    interrupts: AtomicUsize,
}

impl MockShell {
    /// Create a shell whose spawns succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent spawns fail
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent interrupts fail
    pub fn set_fail_interrupt(&self, fail: bool) {
        self.fail_interrupt.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent interrupts hang forever
    pub fn set_stall_interrupt(&self, stall: bool) {
        self.stall_interrupt.store(stall, Ordering::SeqCst);
    }

    /// Number of successful spawns
    pub fn spawn_count(&self) -> usize {
        lock(&self.state).specs.len()
    }

    /// Specs of every successful spawn, in order
    pub fn spawned_specs(&self) -> Vec<ProcessSpec> {
        lock(&self.state).specs.clone()
    }

    /// Number of interrupt requests
    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` interrupts were requested
    pub async fn wait_for_interrupts(&self, count: usize) {
        while self.interrupt_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Take the far end of the `index`-th spawned process
    pub fn take_worker(&self, index: usize) -> Option<MockWorker> {
        lock(&self.state).workers.get_mut(index).and_then(Option::take)
    }

    /// Wait until the `index`-th process has been spawned and take its far end
    pub async fn wait_for_worker(&self, index: usize) -> MockWorker {
        loop {
            if let Some(worker) = self.take_worker(index) {
                return worker;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<RemoteProcess, TransportError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(TransportError::Spawn("mock spawn failure".to_string()));
        }

        let (stdin_writer, stdin_reader) = duplex(PIPE_CAPACITY);
        let (stdout_writer, stdout_reader) = duplex(PIPE_CAPACITY);
        let stdout: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(stdout_writer)));
        let killed = Arc::new(AtomicBool::new(false));

        let control = MockControl {
            stdout: stdout.clone(),
            killed: killed.clone(),
        };
        let worker = MockWorker {
            stdin: BufReader::new(stdin_reader),
            stdout,
            killed,
            spec: spec.clone(),
        };

        let mut state = lock(&self.state);
        let pid = FIRST_MOCK_PID + state.specs.len() as u32;
        state.specs.push(spec.clone());
        state.workers.push(Some(worker));

        Ok(RemoteProcess::new(Box::new(stdin_writer), Box::new(stdout_reader), Box::new(control))
            .with_remote_pid(pid))
    }

    async fn interrupt(&self) -> Result<(), TransportError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.stall_interrupt.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_interrupt.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("mock interrupt failure".to_string()));
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "mock".to_string(),
            port: 22,
            username: "tester".to_string(),
        }
    }
}

struct FsState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Bytes>,
    uploads: usize,
    transient_failures: usize,
    failing_paths: HashSet<String>,
}

/// [`RemoteFileTransfer`] over an in-memory file system
pub struct MockTransfer {
    state: Mutex<FsState>,
}

impl Default for MockTransfer {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn not_found(path: &str) -> TransportError {
    TransportError::CommandFailed {
        code: 1,
        message: format!("{}: No such file or directory", path),
    }
}

impl MockTransfer {
    /// Create a file system containing `/` and `/tmp`
    pub fn new() -> Self {
        let dirs = ["/", "/tmp"].iter().map(|d| d.to_string()).collect();
        Self {
            state: Mutex::new(FsState {
                dirs,
                files: BTreeMap::new(),
                uploads: 0,
                transient_failures: 0,
                failing_paths: HashSet::new(),
            }),
        }
    }

    /// Add a directory
    pub fn with_dir(self, path: &str) -> Self {
        lock(&self.state).dirs.insert(path.to_string());
        self
    }

    /// Add a file
    pub fn with_file(self, path: &str, data: impl Into<Bytes>) -> Self {
        lock(&self.state).files.insert(path.to_string(), data.into());
        self
    }

    /// Fail the next `count` operations with a transient error
    pub fn fail_transiently(&self, count: usize) {
        lock(&self.state).transient_failures = count;
    }

    /// Fail every operation on `path` with a permanent error
    pub fn fail_path(&self, path: &str) {
        lock(&self.state).failing_paths.insert(path.to_string());
    }

    /// Number of file writes performed
    pub fn upload_count(&self) -> usize {
        lock(&self.state).uploads
    }

    /// Contents of a file
    pub fn file(&self, path: &str) -> Option<Bytes> {
        lock(&self.state).files.get(path).cloned()
    }

    /// Whether a directory exists
    pub fn has_dir(&self, path: &str) -> bool {
        lock(&self.state).dirs.contains(path)
    }

    /// Lock the state after applying injected failures
    fn enter(&self, path: &str) -> Result<MutexGuard<'_, FsState>, TransportError> {
        let mut state = lock(&self.state);
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(TransportError::Connection("mock connection reset".to_string()));
        }
        if state.failing_paths.contains(path) {
            return Err(TransportError::CommandFailed {
                code: 1,
                message: format!("{}: Permission denied", path),
            });
        }
        Ok(state)
    }
}

impl FsState {
    fn stat(&self, path: &str) -> Option<FileStat> {
        if self.dirs.contains(path) {
            Some(FileStat {
                kind: FileKind::Dir,
                size: 4096,
                modified: 0,
                mode: 0o755,
            })
        } else {
            self.files.get(path).map(|data| FileStat {
                kind: FileKind::File,
                size: data.len() as u64,
                modified: 0,
                mode: 0o644,
            })
        }
    }
}

#[async_trait]
impl RemoteFileTransfer for MockTransfer {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransportError> {
        Ok(self.enter(path)?.stat(path))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        let state = self.enter(path)?;
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }

        let names: BTreeSet<&str> = state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|p| p.as_str() != path && parent_of(p) == path)
            .filter_map(|p| p.rsplit_once('/').map(|(_, name)| name))
            .collect();

        Ok(names
            .into_iter()
            .filter_map(|name| {
                let full = format!("{}/{}", path.trim_end_matches('/'), name);
                state.stat(&full).map(|stat| DirEntry {
                    name: name.to_string(),
                    stat,
                })
            })
            .collect())
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        let mut state = self.enter(path)?;
        if !state.dirs.contains(parent_of(path)) {
            return Err(not_found(path));
        }
        if state.stat(path).is_some() {
            return Err(TransportError::CommandFailed {
                code: 1,
                message: format!("{}: File exists", path),
            });
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        let mut state = self.enter(path)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        state.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        state.files.retain(|f, _| f != path && !f.starts_with(&prefix));
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        let state = self.enter(path)?;
        state.files.get(path).cloned().ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        let mut state = self.enter(path)?;
        if !state.dirs.contains(parent_of(path)) || state.dirs.contains(path) {
            return Err(not_found(path));
        }
        state.files.insert(path.to_string(), data);
        state.uploads += 1;
        Ok(())
    }
}
