//! Turns a YAML file into the in-memory structures the core accepts
//! pre-validated. No hot-reload, no schema migration, no multi-source merge —
//! exactly enough config parsing to drive the core, nothing more.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use toolhub_mcp::breaker::CircuitBreakerConfig;
use toolhub_mcp::registry::ServerDeclaration;

#[derive(Debug, Clone, Deserialize)]
pub struct EnhancementRule {
    pub model_id: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnhancementConfig {
    pub default: EnhancementRule,
    #[serde(default)]
    pub rules: HashMap<String, EnhancementRule>,
}

/// Plain, serde-friendly mirror of [`CircuitBreakerConfig`] — the core's own
/// type intentionally carries no serde derive, since config-file parsing is
/// this crate's concern, not the core's.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfigInput {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_timeout_secs() -> u64 {
    30
}
fn default_half_open_max_calls() -> u32 {
    1
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for BreakerConfigInput {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl From<BreakerConfigInput> for CircuitBreakerConfig {
    fn from(input: BreakerConfigInput) -> Self {
        CircuitBreakerConfig {
            failure_threshold: input.failure_threshold,
            recovery_timeout: Duration::from_secs(input.recovery_timeout_secs),
            half_open_max_calls: input.half_open_max_calls,
            success_threshold: input.success_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub servers: Vec<ServerDeclaration>,
    pub enhancement: EnhancementConfig,
    #[serde(default)]
    pub breaker: BreakerConfigInput,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_bridge_timeout_secs")]
    pub bridge_timeout_secs: u64,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_health_tick_secs")]
    pub health_tick_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8999".to_string()
}
fn default_cache_size() -> usize {
    512
}
fn default_bridge_timeout_secs() -> u64 {
    30
}
fn default_init_timeout_secs() -> u64 {
    10
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_ollama_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_health_tick_secs() -> u64 {
    5
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("invalid server declaration: {0}")]
    InvalidServer(#[from] toolhub_mcp::error::RouterError),
}

impl RouterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: RouterConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), toolhub_mcp::error::RouterError> {
        for declaration in &self.servers {
            declaration.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
bind_addr: "127.0.0.1:9000"
servers:
  - name: echo
    command: cat-like-echo
    args: []
    auto_start: true
enhancement:
  default:
    model_id: llama3
    system_prompt: "be terse"
"#;

    #[test]
    fn parses_a_minimal_config() {
        let config: RouterConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "echo");
        assert_eq!(config.enhancement.default.model_id, "llama3");
        assert_eq!(config.cache_size, 512);
    }

    #[test]
    fn rejects_a_server_missing_a_command() {
        let bad = r#"
servers:
  - name: echo
    command: ""
enhancement:
  default:
    model_id: llama3
"#;
        let config: RouterConfig = serde_yaml::from_str(bad).unwrap();
        assert!(config.validate().is_err());
    }
}
