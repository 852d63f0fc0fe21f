//! In-memory catalogue of declared tool servers and their process state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::RouterError;

/// How to resolve one environment variable value at launch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    CredentialRef { store: String, key: String },
}

/// Static description of a tool server: name, command, args, env, restart
/// policy. Loaded once at startup, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDeclaration {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, EnvValue>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(default)]
    pub description: String,
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(15)
}

impl ServerDeclaration {
    /// Reject entries missing required fields. Duplicate-name detection
    /// happens at the registry level, where the full set is visible.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.name.trim().is_empty() {
            return Err(RouterError::InvalidInput(
                "server declaration is missing a name".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(RouterError::InvalidInput(format!(
                "server declaration \"{}\" is missing a command",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Mutable, supervisor-owned state for one declared server.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub last_activity_at: Option<SystemTime>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            pid: None,
            restart_count: 0,
            last_error: None,
            started_at: None,
            last_activity_at: None,
        }
    }
}

struct Entry {
    declaration: ServerDeclaration,
    state: ProcessState,
}

/// Catalogue of declared servers and their current process state, keyed by
/// name. Each accessor (`get`, [`ServerRegistry::set_status`], ...) takes
/// the outer lock for the duration of its own read or write; a caller
/// needing a read-then-write sequence composes them one at a time rather
/// than holding the lock across both, since every mutation here is a single
/// whole-entry update.
pub struct ServerRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ServerRegistry {
    /// Build a registry from a set of declarations, rejecting the whole set
    /// if any entry is ill-formed or a name repeats.
    pub fn load(declarations: Vec<ServerDeclaration>) -> Result<Arc<Self>, RouterError> {
        let mut entries = HashMap::with_capacity(declarations.len());
        for declaration in declarations {
            declaration.validate()?;
            if entries.contains_key(&declaration.name) {
                return Err(RouterError::InvalidInput(format!(
                    "duplicate server name \"{}\"",
                    declaration.name
                )));
            }
            let name = declaration.name.clone();
            entries.insert(
                name,
                Entry {
                    declaration,
                    state: ProcessState::default(),
                },
            );
        }
        Ok(Arc::new(Self {
            entries: RwLock::new(entries),
        }))
    }

    pub async fn get(&self, name: &str) -> Result<(ServerDeclaration, ProcessState), RouterError> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|entry| (entry.declaration.clone(), entry.state.clone()))
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))
    }

    pub async fn list(&self) -> Vec<(ServerDeclaration, ProcessState)> {
        let entries = self.entries.read().await;
        let mut out: Vec<_> = entries
            .values()
            .map(|entry| (entry.declaration.clone(), entry.state.clone()))
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        out
    }

    pub async fn auto_start_set(&self) -> Vec<ServerDeclaration> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.declaration.auto_start)
            .map(|entry| entry.declaration.clone())
            .collect()
    }

    pub async fn set_status(&self, name: &str, status: ProcessStatus) -> Result<(), RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.status = status;
        match status {
            ProcessStatus::Running => {
                entry.state.started_at = Some(SystemTime::now());
                entry.state.last_activity_at = Some(SystemTime::now());
            }
            ProcessStatus::Stopped => {
                entry.state.pid = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn set_pid(&self, name: &str, pid: Option<u32>) -> Result<(), RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.pid = pid;
        Ok(())
    }

    pub async fn set_last_error(&self, name: &str, message: impl Into<String>) -> Result<(), RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.last_error = Some(message.into());
        Ok(())
    }

    pub async fn increment_restart_count(&self, name: &str) -> Result<u32, RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.restart_count += 1;
        Ok(entry.state.restart_count)
    }

    pub async fn reset_restart_count(&self, name: &str) -> Result<(), RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.restart_count = 0;
        Ok(())
    }

    pub async fn touch_activity(&self, name: &str) -> Result<(), RouterError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownServer(name.to_string()))?;
        entry.state.last_activity_at = Some(SystemTime::now());
        Ok(())
    }
}
