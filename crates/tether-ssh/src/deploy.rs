//! Worker code deployment
//!
//! The worker runtime is a fixed set of files copied into a per-version,
//! per-user directory on the remote host. Released versions are uploaded once
//! and reused by later sessions; development versions are uploaded every time.

use crate::retry::RetryPolicy;
use crate::transfer::RemoteFileTransfer;
use crate::TransportError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Version suffix marking a development build
pub const DEVELOPMENT_SUFFIX: &str = "-dev";

/// Remote directory holding the worker for `tool` at `version`, owned by `user`
pub fn deployment_dir(tool: &str, version: &str, user: &str) -> String {
    format!("/tmp/{}-backend-{}-{}", tool, version, user)
}

/// Whether `version` is a development build that must always be re-uploaded
pub fn is_development_version(version: &str) -> bool {
    version.ends_with(DEVELOPMENT_SUFFIX)
}

/// The files making up the worker runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBundle {
    /// Local directory the relative paths are resolved against
    pub local_root: PathBuf,
    /// Relative file paths
    pub files: Vec<String>,
}

impl WorkerBundle {
    /// Create a bundle of `files` under `local_root`
    pub fn new<I, S>(local_root: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local_root: local_root.into(),
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// The standard worker package
    pub fn standard(local_root: impl Into<PathBuf>) -> Self {
        Self::new(
            local_root,
            [
                "tether_worker/__init__.py",
                "tether_worker/common.py",
                "tether_worker/backend.py",
                "tether_worker/launcher.py",
                "tether_worker/tracers.py",
            ],
        )
    }

    /// Local path of a bundle file
    pub fn local_path(&self, relative: &str) -> PathBuf {
        self.local_root.join(relative)
    }

    /// Remote path of a bundle file under `remote_dir`
    pub fn remote_path(&self, remote_dir: &str, relative: &str) -> String {
        format!(
            "{}/{}",
            remote_dir.trim_end_matches('/'),
            relative.replace('\\', "/").trim_start_matches('/')
        )
    }
}

/// What [`Deployer::deploy_if_needed`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A usable deployment was already present
    Skipped,
    /// Files were uploaded
    Uploaded {
        /// Number of uploaded files
        files: usize,
    },
}

/// Copies a [`WorkerBundle`] to the remote host
pub struct Deployer<'a> {
    /// File transfer to the remote host
    transfer: &'a dyn RemoteFileTransfer,
    /// Retry policy applied to every remote operation
    retry: RetryPolicy,
}

impl<'a> Deployer<'a> {
    /// Create a deployer
    pub fn new(transfer: &'a dyn RemoteFileTransfer, retry: RetryPolicy) -> Self {
        Self { transfer, retry }
    }

    /// Upload `bundle` into `remote_dir` unless a usable copy is already there
    pub async fn deploy_if_needed(
        &self,
        bundle: &WorkerBundle,
        remote_dir: &str,
        version: &str,
    ) -> Result<DeployOutcome, TransportError> {
        let existing = self
            .retry
            .run("stat", || self.transfer.stat(remote_dir))
            .await?;

        if existing.is_some() && !is_development_version(version) {
            debug!("Worker {} already deployed at {}", version, remote_dir);
            return Ok(DeployOutcome::Skipped);
        }

        info!("Deploying worker {} to {}", version, remote_dir);

        for relative in &bundle.files {
            let remote_path = bundle.remote_path(remote_dir, relative);
            if let Some((parent, _)) = remote_path.rsplit_once('/') {
                self.ensure_directory(parent).await?;
            }

            let local_path = bundle.local_path(relative);
            debug!("Uploading {} to {}", local_path.display(), remote_path);
            self.upload(&local_path, &remote_path).await?;
        }

        info!("Deployed {} worker files", bundle.files.len());
        Ok(DeployOutcome::Uploaded {
            files: bundle.files.len(),
        })
    }

    /// Create every missing component of the absolute POSIX directory `path`
    pub async fn ensure_directory(&self, path: &str) -> Result<(), TransportError> {
        let mut current = String::new();
        let mut missing = false;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);

            if !missing {
                match self.retry.run("stat", || self.transfer.stat(&current)).await? {
                    Some(stat) if stat.is_dir() => continue,
                    Some(_) => {
                        return Err(TransportError::Deploy(format!(
                            "{} exists and is not a directory",
                            current
                        )))
                    }
                    None => missing = true,
                }
            }

            self.retry.run("mkdir", || self.transfer.mkdir(&current)).await?;
        }

        Ok(())
    }

    /// Upload one file under the retry policy
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        if !local_path.is_file() {
            return Err(TransportError::Deploy(format!(
                "Worker file {} not found",
                local_path.display()
            )));
        }

        self.retry
            .run("upload", || self.transfer.put(local_path, remote_path))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransfer;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn local_bundle() -> (TempDir, WorkerBundle) {
        let dir = TempDir::new().unwrap();
        let bundle = WorkerBundle::standard(dir.path());
        for relative in &bundle.files {
            let path = bundle.local_path(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("# {}\n", relative)).unwrap();
        }
        (dir, bundle)
    }

    #[test]
    fn test_deployment_dir() {
        assert_eq!(
            deployment_dir("tether", "0.1.0", "bob"),
            "/tmp/tether-backend-0.1.0-bob"
        );
    }

    #[test]
    fn test_development_version() {
        assert!(is_development_version("0.2.0-dev"));
        assert!(!is_development_version("0.2.0"));
        assert!(!is_development_version("0.2.0-devel"));
    }

    #[test]
    fn test_remote_path_normalises_separators() {
        let bundle = WorkerBundle::new("/local", ["tether_worker\\launcher.py"]);
        assert_eq!(
            bundle.remote_path("/tmp/dir/", "tether_worker\\launcher.py"),
            "/tmp/dir/tether_worker/launcher.py"
        );
    }

    #[tokio::test]
    async fn test_first_deploy_uploads_every_file() {
        let (_dir, bundle) = local_bundle();
        let transfer = MockTransfer::new();
        let deployer = Deployer::new(&transfer, fast_retry());

        let outcome = deployer
            .deploy_if_needed(&bundle, "/tmp/tether-backend-0.1.0-bob", "0.1.0")
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Uploaded { files: 5 });
        assert_eq!(transfer.upload_count(), 5);
        assert!(transfer.has_dir("/tmp/tether-backend-0.1.0-bob/tether_worker"));
        assert_eq!(
            transfer.file("/tmp/tether-backend-0.1.0-bob/tether_worker/launcher.py").unwrap(),
            "# tether_worker/launcher.py\n"
        );
    }

    #[tokio::test]
    async fn test_release_version_deploys_once() {
        let (_dir, bundle) = local_bundle();
        let transfer = MockTransfer::new();
        let deployer = Deployer::new(&transfer, fast_retry());
        let remote_dir = "/tmp/tether-backend-0.1.0-bob";

        deployer.deploy_if_needed(&bundle, remote_dir, "0.1.0").await.unwrap();
        let second = deployer.deploy_if_needed(&bundle, remote_dir, "0.1.0").await.unwrap();

        assert_eq!(second, DeployOutcome::Skipped);
        assert_eq!(transfer.upload_count(), 5);
    }

    #[tokio::test]
    async fn test_development_version_always_uploads() {
        let (_dir, bundle) = local_bundle();
        let transfer = MockTransfer::new();
        let deployer = Deployer::new(&transfer, fast_retry());
        let remote_dir = "/tmp/tether-backend-0.2.0-dev-bob";

        deployer.deploy_if_needed(&bundle, remote_dir, "0.2.0-dev").await.unwrap();
        let second = deployer.deploy_if_needed(&bundle, remote_dir, "0.2.0-dev").await.unwrap();

        assert_eq!(second, DeployOutcome::Uploaded { files: 5 });
        assert_eq!(transfer.upload_count(), 10);
    }

    #[tokio::test]
    async fn test_ensure_directory_creates_missing_levels() {
        let transfer = MockTransfer::new();
        let deployer = Deployer::new(&transfer, fast_retry());

        deployer.ensure_directory("/tmp/a/b/c").await.unwrap();

        assert!(transfer.has_dir("/tmp/a"));
        assert!(transfer.has_dir("/tmp/a/b"));
        assert!(transfer.has_dir("/tmp/a/b/c"));

        // Existing directories are left alone
        deployer.ensure_directory("/tmp/a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_directory_rejects_file_component() {
        let transfer = MockTransfer::new().with_file("/tmp/a", "not a dir");
        let deployer = Deployer::new(&transfer, fast_retry());

        let result = deployer.ensure_directory("/tmp/a/b").await;
        assert!(matches!(result, Err(TransportError::Deploy(_))));
    }

    #[tokio::test]
    async fn test_transient_transfer_failures_are_retried() {
        let (_dir, bundle) = local_bundle();
        let transfer = MockTransfer::new();
        transfer.fail_transiently(2);
        let deployer = Deployer::new(&transfer, fast_retry());

        let outcome = deployer
            .deploy_if_needed(&bundle, "/tmp/tether-backend-0.1.0-bob", "0.1.0")
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Uploaded { files: 5 });
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_deployment() {
        let (_dir, bundle) = local_bundle();
        let transfer = MockTransfer::new();
        transfer.fail_transiently(100);
        let deployer = Deployer::new(&transfer, fast_retry());

        let result = deployer
            .deploy_if_needed(&bundle, "/tmp/tether-backend-0.1.0-bob", "0.1.0")
            .await;

        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert_eq!(transfer.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let bundle = WorkerBundle::new(dir.path(), ["tether_worker/launcher.py"]);
        let transfer = MockTransfer::new();
        let deployer = Deployer::new(&transfer, fast_retry());

        let result = deployer
            .deploy_if_needed(&bundle, "/tmp/tether-backend-0.1.0-bob", "0.1.0")
            .await;

        assert!(matches!(result, Err(TransportError::Deploy(_))));
    }
}
