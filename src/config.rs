//! TOML configuration for cadence.
//!
//! Layered lookup: the file named by `CADENCE_CONFIG`, then
//! `~/.cadence/config.toml`, then compiled-in defaults. Every section is
//! optional and partially specified sections fall back field by field.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CADENCE_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CadenceConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `CADENCE_CONFIG` environment variable.
    /// 2. `~/.cadence/config.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CADENCE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let user_path = default_data_dir().join("config.toml");
        if user_path.exists() {
            match Self::load(&user_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %user_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Task database path; relative paths live under `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.storage.resolve(&self.storage.database_path)
    }

    /// Run history file path; relative paths live under `data_dir`.
    pub fn history_path(&self) -> PathBuf {
        self.storage.resolve(&self.storage.history_path)
    }

    /// Where scheduled runs write their stdout/stderr.
    pub fn log_dir(&self) -> PathBuf {
        self.storage.resolve(&self.scheduler.log_dir)
    }

    pub fn launch_agents_dir(&self) -> PathBuf {
        self.scheduler
            .launch_agents_dir
            .clone()
            .unwrap_or_else(|| home_dir().join("Library").join("LaunchAgents"))
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.cadence`, the well-known location of all cadence state.
pub fn default_data_dir() -> PathBuf {
    home_dir().join(".cadence")
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Locations of the task registry and run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for relative paths below.
    pub data_dir: PathBuf,
    /// SQLite database holding task definitions.
    pub database_path: PathBuf,
    /// JSON run history read by catch-up and `cadence history`.
    pub history_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: PathBuf::from("tasks.db"),
            history_path: PathBuf::from("history.json"),
        }
    }
}

impl StorageConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Which OS scheduler to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// launchd on macOS, crontab on other Unix systems.
    Auto,
    Launchd,
    Crontab,
    /// Never touch the OS scheduler.
    None,
}

/// OS scheduler registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub backend: BackendChoice,
    /// Directory for launchd agent plists. Defaults to `~/Library/LaunchAgents`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_agents_dir: Option<PathBuf>,
    /// launchd labels are `<label_prefix>.<task>`.
    pub label_prefix: String,
    /// Binary the OS scheduler invokes. Defaults to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    /// Output of scheduled runs; relative to `storage.data_dir` unless absolute.
    pub log_dir: PathBuf,
    /// Register launchd agents with `RunAtLoad` so missed runs fire at login.
    pub run_at_load: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            launch_agents_dir: None,
            label_prefix: "dev.cadence".to_string(),
            program: None,
            log_dir: PathBuf::from("logs"),
            run_at_load: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// How a task's executor id is turned into a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub program: String,
    /// Arguments; `{task}`, `{executor}` and `{trigger}` are substituted.
    pub args: Vec<String>,
    /// Kill the run after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "{executor}".to_string()],
            timeout_secs: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
