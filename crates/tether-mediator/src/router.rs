//! Command classification and local handler dispatch

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_proto::{Command, Response};
use tracing::{debug, warn};

/// A command the mediator answers itself instead of forwarding it
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Handle the command and return the response payload
    async fn handle(&self, cmd: &Command) -> anyhow::Result<Map<String, Value>>;
}

/// Where a command goes after any restart
#[derive(Clone)]
pub enum Target {
    /// Answered by a local handler
    Local(Arc<dyn LocalHandler>),
    /// Forwarded to the worker
    Worker,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Worker => f.write_str("Worker"),
        }
    }
}

/// Routing decision for one command
#[derive(Debug, Clone)]
pub struct Route {
    /// Whether the worker must be replaced first
    pub restart: bool,
    /// Who answers the command
    pub target: Target,
}

/// Maps command names to local handlers
#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<&'static str, Arc<dyn LocalHandler>>,
}

impl CommandRouter {
    /// Create a router without local handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local handler for `name`
    pub fn register(&mut self, name: &'static str, handler: Arc<dyn LocalHandler>) {
        debug!("Registered local handler: {}", name);
        self.handlers.insert(name, handler);
    }

    /// Register a local handler for `name`, builder style
    pub fn with_handler(mut self, name: &'static str, handler: Arc<dyn LocalHandler>) -> Self {
        self.register(name, handler);
        self
    }

    /// Names of all local handlers
    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Classify a command
    pub fn route(&self, cmd: &Command) -> Route {
        let target = match self.handlers.get(cmd.name.as_str()) {
            Some(handler) => Target::Local(Arc::clone(handler)),
            None => Target::Worker,
        };

        Route {
            restart: cmd.is_restart_trigger(),
            target,
        }
    }
}

/// Run a local handler; a failure becomes an error-shaped response
pub async fn invoke(handler: &dyn LocalHandler, cmd: &Command) -> Response {
    match handler.handle(cmd).await {
        Ok(fields) => Response::for_command(cmd, fields),
        Err(e) => {
            warn!("Local handler {} failed: {:#}", cmd.name, e);
            Response::error(cmd, format!("{:#}", e))
        }
    }
}
