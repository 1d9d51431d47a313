//! Server configuration.

use derive_getters::Getters;
use derive_more::{Display, Error};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Tunables for sessions, sweeps, persistence retries and the analysis
/// service. Every field has a default, so an empty TOML file is valid.
#[derive(Debug, Clone, PartialEq, Getters, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
pub struct ServerConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    database_path: String,

    /// Seconds a completed game stays in memory after its final save.
    #[serde(default = "default_completed_grace_secs")]
    completed_grace_secs: u64,

    /// Seconds of inactivity before an in-progress game leaves memory.
    #[serde(default = "default_idle_eviction_secs")]
    idle_eviction_secs: u64,

    /// Days of inactivity before a stored game is marked abandoned.
    #[serde(default = "default_abandon_after_days")]
    abandon_after_days: u64,

    /// Cadence of the eviction and abandonment sweep.
    #[serde(default = "default_eviction_sweep_secs")]
    eviction_sweep_secs: u64,

    /// Cadence of the correspondence deadline sweep.
    #[serde(default = "default_correspondence_sweep_secs")]
    correspondence_sweep_secs: u64,

    /// How long an action waits for a busy session before giving up.
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,

    /// Write attempts per action before the session is marked degraded.
    #[serde(default = "default_persist_max_attempts")]
    persist_max_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_persist_backoff_ms")]
    persist_backoff_ms: u64,

    /// Highest value the doubling cube may reach.
    #[serde(default = "default_max_cube_value")]
    max_cube_value: u32,

    /// Base URL of the GNU Backgammon analysis service.
    #[serde(default)]
    #[setters(strip_option)]
    analysis_url: Option<String>,

    /// Request timeout for the analysis service.
    #[serde(default = "default_analysis_timeout_ms")]
    analysis_timeout_ms: u64,

    /// Search depth requested from the analysis service.
    #[serde(default = "default_analysis_plies")]
    analysis_plies: u8,
}

#[instrument]
fn default_database_path() -> String {
    "gammon.db".to_string()
}

#[instrument]
fn default_completed_grace_secs() -> u64 {
    300
}

#[instrument]
fn default_idle_eviction_secs() -> u64 {
    6 * 60 * 60
}

#[instrument]
fn default_abandon_after_days() -> u64 {
    90
}

#[instrument]
fn default_eviction_sweep_secs() -> u64 {
    60
}

#[instrument]
fn default_correspondence_sweep_secs() -> u64 {
    300
}

#[instrument]
fn default_lock_timeout_ms() -> u64 {
    5000
}

#[instrument]
fn default_persist_max_attempts() -> u32 {
    4
}

#[instrument]
fn default_persist_backoff_ms() -> u64 {
    50
}

#[instrument]
fn default_max_cube_value() -> u32 {
    strictly_backgammon::DEFAULT_MAX_CUBE
}

#[instrument]
fn default_analysis_timeout_ms() -> u64 {
    30_000
}

#[instrument]
fn default_analysis_plies() -> u8 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            completed_grace_secs: default_completed_grace_secs(),
            idle_eviction_secs: default_idle_eviction_secs(),
            abandon_after_days: default_abandon_after_days(),
            eviction_sweep_secs: default_eviction_sweep_secs(),
            correspondence_sweep_secs: default_correspondence_sweep_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            persist_max_attempts: default_persist_max_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
            max_cube_value: default_max_cube_value(),
            analysis_url: None,
            analysis_timeout_ms: default_analysis_timeout_ms(),
            analysis_plies: default_analysis_plies(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;
        let config = Self::from_toml(&content)?;
        info!(database = %config.database_path, "Config loaded successfully");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML or out-of-range values.
    #[instrument(skip(content))]
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        if config.persist_max_attempts == 0 {
            return Err(ConfigError::new(
                "persist_max_attempts must be at least 1".to_string(),
            ));
        }
        if !config.max_cube_value.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "max_cube_value must be a power of two, got {}",
                config.max_cube_value
            )));
        }
        Ok(config)
    }

    /// Grace period for completed games.
    pub fn completed_grace(&self) -> Duration {
        Duration::from_secs(self.completed_grace_secs)
    }

    /// Idle threshold for in-progress games.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    /// Inactivity horizon for abandonment.
    pub fn abandon_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.abandon_after_days.min(36_500) as i64)
    }

    /// Interval between eviction sweeps.
    pub fn eviction_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_sweep_secs.max(1))
    }

    /// Interval between correspondence sweeps.
    pub fn correspondence_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.correspondence_sweep_secs.max(1))
    }

    /// Session lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// First retry delay.
    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    /// Analysis request timeout.
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: String) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
