use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level Flowline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    #[serde(default)]
    pub handlers: HandlersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-call deadline for actions of workflows without a timeout.
    #[serde(default = "default_action_timeout")]
    pub default_action_timeout_secs: u64,
    /// Concurrency cap for workflows that don't set `max_concurrent_runs`.
    #[serde(default = "default_max_concurrent_runs")]
    pub default_max_concurrent_runs: usize,
    /// Capacity of the engine event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_action_timeout_secs: default_action_timeout(),
            default_max_concurrent_runs: default_max_concurrent_runs(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_action_timeout() -> u64 { 30 }
fn default_max_concurrent_runs() -> usize { 10 }
fn default_event_capacity() -> usize { 1024 }

/// Persistence backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path for the sqlite backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.flowline/flowline.db".to_string() }

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.flowline/logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.flowline/logs".to_string() }

/// Where workflow definition files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    #[serde(default = "default_workflows_dir")]
    pub dir: String,
    /// Activate imported definitions that are still drafts.
    #[serde(default)]
    pub activate_on_import: bool,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            dir: default_workflows_dir(),
            activate_on_import: false,
        }
    }
}

fn default_workflows_dir() -> String { "./workflows".to_string() }

/// Settings for the built-in action handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlersConfig {
    #[serde(default)]
    pub webhook: WebhookHandlerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookHandlerConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebhookHandlerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_webhook_timeout() -> u64 { 30 }
fn default_user_agent() -> String { format!("flowline/{}", env!("CARGO_PKG_VERSION")) }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Load the config file if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.workflows.dir)
    }

    /// Log directory, if event logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
            match std::env::var(&name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
