//! ScriptGuard application configuration.
//!
//! Static, file-based settings: where data lives, how the gateway binds, how
//! often the scheduler ticks, and how environments are discovered. Runtime
//! knobs that the UI edits (concurrency, timeout, retention, webhooks) live in
//! the settings table instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ScriptGuardError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptGuardConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Environments declared by hand, in addition to discovered ones.
    #[serde(default)]
    pub environments: Vec<DeclaredEnvironment>,
}

fn default_data_dir() -> String { "~/.scriptguard".into() }

impl Default for ScriptGuardConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            discovery: DiscoveryConfig::default(),
            environments: Vec::new(),
        }
    }
}

impl ScriptGuardConfig {
    /// Load config from the default path (~/.scriptguard/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScriptGuardError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ScriptGuardError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ScriptGuardError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ScriptGuard home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".scriptguard")
    }

    /// Resolved data directory (`~` expanded).
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    /// SQLite database file inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_path().join("scriptguard.db")
    }
}

/// HTTP gateway binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 7878 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Background loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Clock tick for due-task evaluation.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often the retention sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
    /// How long to wait for output pipes to drain after a kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Off for one-shot CLI commands so they never fire cron tasks.
    #[serde(default = "bool_true")]
    pub fire_schedules: bool,
}

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_sweep_interval_secs() -> u64 { 3600 }
fn default_kill_grace_ms() -> u64 { 3000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            retention_sweep_interval_secs: default_sweep_interval_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            fire_schedules: true,
        }
    }
}

/// Environment discovery sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "bool_true")]
    pub scan_conda: bool,
    #[serde(default = "default_conda_executable")]
    pub conda_executable: String,
    #[serde(default = "bool_true")]
    pub scan_path: bool,
    #[serde(default = "default_path_interpreters")]
    pub path_interpreters: Vec<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

fn bool_true() -> bool { true }
fn default_conda_executable() -> String { "conda".into() }
fn default_path_interpreters() -> Vec<String> {
    ["python3", "python", "node", "bash", "sh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_scan_timeout_secs() -> u64 { 30 }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_conda: true,
            conda_executable: default_conda_executable(),
            scan_path: true,
            path_interpreters: default_path_interpreters(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

/// An environment declared in config rather than discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredEnvironment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub executable: String,
}
