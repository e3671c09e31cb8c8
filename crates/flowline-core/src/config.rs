use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowlineError, Result};
use crate::event::EventKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on blocking step functions running at once (default: 8).
    #[serde(default = "default_max_blocking_workers")]
    pub max_blocking_workers: usize,
    /// Keep the ordered event log on the run response (default: false).
    #[serde(default)]
    pub store_events: bool,
    /// Event kinds dropped from both the live stream and the stored log.
    #[serde(default)]
    pub events_to_skip: Vec<EventKind>,
    /// Deliver unit-level events, not only workflow-level ones (default: false).
    #[serde(default)]
    pub stream_intermediate_steps: bool,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_blocking_workers: default_max_blocking_workers(),
            store_events: false,
            events_to_skip: Vec::new(),
            stream_intermediate_steps: false,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

fn default_max_blocking_workers() -> usize { 8 }
fn default_event_bus_capacity() -> usize { 256 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Json,
}

/// Session persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file (sqlite) or directory (json). Default: under ~/.flowline
    #[serde(default)]
    pub path: Option<String>,
}

impl StorageConfig {
    /// Resolve the storage path (expand ~), falling back to a per-backend default.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => expand_home(p),
            None => {
                let base = expand_home("~/.flowline");
                match self.backend {
                    StorageBackend::Sqlite => base.join("sessions.db"),
                    StorageBackend::Json | StorageBackend::Memory => base.join("sessions"),
                }
            }
        }
    }
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.flowline/logs
    #[serde(default)]
    pub dir: Option<String>,
    /// 1 = run summary only, 2 = + unit events, 3 = + content deltas (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(d) => expand_home(d),
            None => expand_home("~/.flowline/logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowlineError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FlowlineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_blocking_workers == 0 {
            return Err(FlowlineError::Config(
                "engine.max_blocking_workers must be at least 1".into(),
            ));
        }
        if self.engine.event_bus_capacity == 0 {
            return Err(FlowlineError::Config(
                "engine.event_bus_capacity must be at least 1".into(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(FlowlineError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Default config file location: ~/.flowline/config.toml
    pub fn default_path() -> PathBuf {
        expand_home("~/.flowline/config.toml")
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left in place.
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
