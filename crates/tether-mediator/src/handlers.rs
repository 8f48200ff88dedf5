//! File system commands answered by the mediator itself

use crate::router::{CommandRouter, LocalHandler};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tether_proto::Command;
use tether_ssh::{FileStat, RemoteFileTransfer};
use tracing::debug;

/// Required string argument of a command
fn required_str<'a>(cmd: &'a Command, key: &str) -> Result<&'a str> {
    cmd.get_str(key)
        .ok_or_else(|| anyhow!("Command {} requires a string \"{}\" argument", cmd.name, key))
}

fn stat_fields(stat: &FileStat) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("type".to_string(), json!(stat.kind.as_str()));
    fields.insert("size".to_string(), json!(stat.size));
    fields.insert("modified".to_string(), json!(stat.modified));
    fields.insert("mode".to_string(), json!(stat.mode));
    fields
}

fn path_fields(path: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("path".to_string(), json!(path));
    fields
}

/// `stat_path {path}`: metadata of a remote path
pub struct StatPathHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for StatPathHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        let mut fields = path_fields(path);

        match self.transfer.stat(path).await? {
            Some(stat) => {
                fields.insert("exists".to_string(), json!(true));
                fields.extend(stat_fields(&stat));
            }
            None => {
                fields.insert("exists".to_string(), json!(false));
            }
        }
        Ok(fields)
    }
}

/// `list_dir {path}`: entries of a remote directory
pub struct ListDirHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for ListDirHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        let entries = self
            .transfer
            .list_dir(path)
            .await
            .with_context(|| format!("Cannot list {}", path))?;

        let entries: Vec<Value> = entries
            .iter()
            .map(|entry| {
                let mut item = stat_fields(&entry.stat);
                item.insert("name".to_string(), json!(entry.name));
                Value::Object(item)
            })
            .collect();

        let mut fields = path_fields(path);
        fields.insert("entries".to_string(), Value::Array(entries));
        Ok(fields)
    }
}

/// `read_file {path}`: contents of a remote text file
pub struct ReadFileHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for ReadFileHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        let data = self
            .transfer
            .read(path)
            .await
            .with_context(|| format!("Cannot read {}", path))?;
        let content = String::from_utf8(data.to_vec())
            .map_err(|_| anyhow!("{} is not a UTF-8 text file", path))?;

        let mut fields = path_fields(path);
        fields.insert("content".to_string(), json!(content));
        Ok(fields)
    }
}

/// `write_file {path, content}`: create or replace a remote text file
pub struct WriteFileHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for WriteFileHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        let content = required_str(cmd, "content")?;
        debug!("Writing {} bytes to {}", content.len(), path);

        self.transfer
            .write(path, Bytes::copy_from_slice(content.as_bytes()))
            .await
            .with_context(|| format!("Cannot write {}", path))?;

        let mut fields = path_fields(path);
        fields.insert("size".to_string(), json!(content.len()));
        Ok(fields)
    }
}

/// `mkdir {path}`: create a remote directory
pub struct MkdirHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for MkdirHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        self.transfer
            .mkdir(path)
            .await
            .with_context(|| format!("Cannot create {}", path))?;
        Ok(path_fields(path))
    }
}

/// `delete {path}`: remove a remote file or directory tree
pub struct DeleteHandler {
    transfer: Arc<dyn RemoteFileTransfer>,
}

#[async_trait]
impl LocalHandler for DeleteHandler {
    async fn handle(&self, cmd: &Command) -> Result<Map<String, Value>> {
        let path = required_str(cmd, "path")?;
        if path.trim_end_matches('/').is_empty() {
            return Err(anyhow!("Refusing to delete the root directory"));
        }

        self.transfer
            .remove(path)
            .await
            .with_context(|| format!("Cannot delete {}", path))?;
        Ok(path_fields(path))
    }
}

/// Router with every file system handler registered
pub fn default_handlers(transfer: Arc<dyn RemoteFileTransfer>) -> CommandRouter {
    CommandRouter::new()
        .with_handler("stat_path", Arc::new(StatPathHandler { transfer: Arc::clone(&transfer) }))
        .with_handler("list_dir", Arc::new(ListDirHandler { transfer: Arc::clone(&transfer) }))
        .with_handler("read_file", Arc::new(ReadFileHandler { transfer: Arc::clone(&transfer) }))
        .with_handler("write_file", Arc::new(WriteFileHandler { transfer: Arc::clone(&transfer) }))
        .with_handler("mkdir", Arc::new(MkdirHandler { transfer: Arc::clone(&transfer) }))
        .with_handler("delete", Arc::new(DeleteHandler { transfer }))
}
