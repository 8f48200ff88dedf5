//! Remote file transfer operations

use crate::process::shell_quote;
use crate::transport::SshTransport;
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tracing::debug;

/// Exit status the stat probe uses for "no such path"
const MISSING_PATH_STATUS: i32 = 3;

/// Kind of a remote file system entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Anything else (device, socket, fifo, dangling link)
    Other,
}

impl FileKind {
    /// Kind from the `S_IFMT` bits of a raw mode
    fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => Self::Dir,
            0o100000 => Self::File,
            _ => Self::Other,
        }
    }

    /// Kind from the type letter printed by `find -printf %Y`
    fn from_find_letter(letter: &str) -> Self {
        match letter {
            "d" => Self::Dir,
            "f" => Self::File,
            _ => Self::Other,
        }
    }

    /// Lowercase name used in responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
            Self::Other => "other",
        }
    }
}

/// Metadata of a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Entry kind
    pub kind: FileKind,
    /// Size in bytes
    pub size: u64,
    /// Modification time in unix seconds
    pub modified: i64,
    /// Permission bits
    pub mode: u32,
}

impl FileStat {
    /// Whether the path is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

/// A directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name without its directory
    pub name: String,
    /// Entry metadata
    pub stat: FileStat,
}

/// File operations on the remote host
#[async_trait]
pub trait RemoteFileTransfer: Send + Sync {
    /// Metadata of `path`, `None` if it does not exist
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransportError>;

    /// Entries of the directory `path`
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError>;

    /// Create the directory `path`; its parent must exist
    async fn mkdir(&self, path: &str) -> Result<(), TransportError>;

    /// Remove `path` recursively
    async fn remove(&self, path: &str) -> Result<(), TransportError>;

    /// Read the whole file at `path`
    async fn read(&self, path: &str) -> Result<Bytes, TransportError>;

    /// Create or replace the file at `path`
    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError>;

    /// Upload a local file to `remote_path`
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        let data = tokio::fs::read(local_path).await?;
        self.write(remote_path, Bytes::from(data)).await
    }
}

/// Parse the output of `stat -c '%f %s %Y'`
fn parse_stat_line(line: &str) -> Result<FileStat, TransportError> {
    let bad = || TransportError::Protocol(format!("Unexpected stat output: {:?}", line));

    let mut parts = line.split_whitespace();
    let raw_mode = parts
        .next()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(bad)?;
    let size = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let modified = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;

    Ok(FileStat {
        kind: FileKind::from_mode(raw_mode),
        size,
        modified,
        mode: raw_mode & 0o7777,
    })
}

/// Parse one line of `find -printf '%Y\t%s\t%T@\t%m\t%f\n'`
fn parse_find_line(line: &str) -> Result<DirEntry, TransportError> {
    let bad = || TransportError::Protocol(format!("Unexpected listing line: {:?}", line));

    let mut parts = line.splitn(5, '\t');
    let kind = parts.next().map(FileKind::from_find_letter).ok_or_else(bad)?;
    let size = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let modified = parts
        .next()
        .and_then(|s| s.split('.').next())
        .and_then(|s| s.parse().ok())
        .ok_or_else(bad)?;
    let mode = parts
        .next()
        .and_then(|s| u32::from_str_radix(s, 8).ok())
        .ok_or_else(bad)?;
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;

    Ok(DirEntry {
        name: name.to_string(),
        stat: FileStat { kind, size, modified, mode },
    })
}

#[async_trait]
impl RemoteFileTransfer for SshTransport {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransportError> {
        let quoted = shell_quote(path);
        let command = format!(
            "[ -e {p} ] || exit {missing}; stat -L -c '%f %s %Y' {p}",
            p = quoted,
            missing = MISSING_PATH_STATUS
        );

        let output = self.execute_command(&command, None).await?;
        match output.code {
            Some(0) => {
                let text = String::from_utf8_lossy(&output.stdout);
                Ok(Some(parse_stat_line(text.trim())?))
            }
            Some(MISSING_PATH_STATUS) => Ok(None),
            code => Err(TransportError::CommandFailed {
                code: code.unwrap_or(-1),
                message: output.stderr,
            }),
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        let command = format!(
            "find -L {} -mindepth 1 -maxdepth 1 -printf '%Y\\t%s\\t%T@\\t%m\\t%f\\n'",
            shell_quote(path)
        );

        let stdout = self.execute_checked(&command, None).await?;
        let text = String::from_utf8_lossy(&stdout);

        let mut entries = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(parse_find_line)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        debug!("Creating remote directory {}", path);
        self.execute_checked(&format!("mkdir {}", shell_quote(path)), None).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        debug!("Removing remote path {}", path);
        self.execute_checked(&format!("rm -rf {}", shell_quote(path)), None).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        self.execute_checked(&format!("cat {}", shell_quote(path)), None).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        debug!("Writing {} bytes to remote file {}", data.len(), path);
        self.execute_checked(&format!("cat > {}", shell_quote(path)), Some(&data)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_line() {
        let stat = parse_stat_line("41ed 4096 1700000000").unwrap();
        assert_eq!(stat.kind, FileKind::Dir);
        assert_eq!(stat.size, 4096);
        assert_eq!(stat.modified, 1_700_000_000);
        assert_eq!(stat.mode, 0o755);
        assert!(stat.is_dir());

        let stat = parse_stat_line("81a4 12 1700000001").unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.mode, 0o644);
    }

    #[test]
    fn test_parse_stat_line_rejects_garbage() {
        assert!(matches!(parse_stat_line("nope"), Err(TransportError::Protocol(_))));
        assert!(matches!(parse_stat_line("81a4 12"), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_parse_find_line() {
        let entry = parse_find_line("f\t12\t1700000000.1234567890\t644\tmain.py").unwrap();
        assert_eq!(entry.name, "main.py");
        assert_eq!(entry.stat.kind, FileKind::File);
        assert_eq!(entry.stat.size, 12);
        assert_eq!(entry.stat.modified, 1_700_000_000);
        assert_eq!(entry.stat.mode, 0o644);

        let entry = parse_find_line("d\t4096\t1700000000.0\t755\tname\twith tab").unwrap();
        assert_eq!(entry.name, "name\twith tab");
        assert!(entry.stat.is_dir());

        let entry = parse_find_line("p\t0\t1700000000.0\t600\tfifo").unwrap();
        assert_eq!(entry.stat.kind, FileKind::Other);
    }

    #[test]
    fn test_parse_find_line_rejects_missing_name() {
        assert!(parse_find_line("f\t12\t1700000000.0\t644\t").is_err());
        assert!(parse_find_line("f\t12").is_err());
    }

    #[test]
    fn test_file_kind_names() {
        assert_eq!(FileKind::File.as_str(), "file");
        assert_eq!(FileKind::Dir.as_str(), "dir");
        assert_eq!(FileKind::Other.as_str(), "other");
    }
}
