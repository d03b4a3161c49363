//! Pantry configuration
//!
//! Settings come from built-in defaults, then `~/.config/pantry/config.toml`,
//! then `PANTRY_*` environment variables, each layer overriding the last.
//!
//! The `sync` table holds the engine settings. At runtime they are changed
//! through [`SyncConfig::apply`], which validates a partial update and leaves
//! the current settings untouched when the update is rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix
const ENV_PREFIX: &str = "PANTRY";

/// Lower bound for the automatic sync interval
pub const MIN_SYNC_INTERVAL_MS: u64 = 1_000;

/// Upper bound for the push batch size
pub const MAX_BATCH_SIZE: usize = 500;

/// Top-level settings shared by the CLI and the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the remote sync service
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Log file (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Sync engine settings
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            log_file: None,
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default config file, with `PANTRY_*` overrides
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config
            .sync
            .validate()
            .with_context(|| format!("Invalid sync settings in {:?}", path))?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Parse settings from TOML text
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.sync.validate().context("Invalid sync settings")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        // PANTRY_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // PANTRY_REMOTE_URL
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        // PANTRY_AUTO_SYNC
        if let Ok(val) = std::env::var(format!("{}_AUTO_SYNC", ENV_PREFIX)) {
            self.sync.auto_sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // PANTRY_SYNC_INTERVAL_MS
        if let Ok(val) = std::env::var(format!("{}_SYNC_INTERVAL_MS", ENV_PREFIX)) {
            self.sync.sync_interval_ms = val
                .parse()
                .with_context(|| format!("Invalid {}_SYNC_INTERVAL_MS: {}", ENV_PREFIX, val))?;
        }

        // PANTRY_CONFLICT_RESOLUTION
        if let Ok(val) = std::env::var(format!("{}_CONFLICT_RESOLUTION", ENV_PREFIX)) {
            self.sync.conflict_resolution = val.parse()?;
        }

        Ok(())
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// `PANTRY_CONFIG`, or `config.toml` under the platform config dir
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pantry")
            .join("config.toml")
    }

    /// Database file inside the data directory
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("pantry.db")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pantry")
}

/// How a detected conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Local version wins and is pushed again
    Local,
    /// Remote version overwrites the local one
    Remote,
    /// Field-level union, last writer wins per field
    Merge,
    /// Park the conflict until the user decides
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Rejected configuration input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync_interval_ms must be at least {min} (got {value})")]
    IntervalTooShort { value: u64, min: u64 },

    #[error("batch_size must be between 1 and {max} (got {value})")]
    BatchSize { value: usize, max: usize },

    #[error("request_timeout_ms must be greater than zero")]
    ZeroTimeout,

    #[error("initial_backoff_ms must be greater than zero")]
    ZeroBackoff,

    #[error("max_backoff_ms ({max}) must not be below initial_backoff_ms ({initial})")]
    BackoffRange { initial: u64, max: u64 },

    #[error("Unknown conflict resolution '{0}' (expected local, remote, merge or manual)")]
    UnknownStrategy(String),
}

/// Sync engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run cycles on the interval timer
    pub auto_sync_enabled: bool,
    /// Interval between automatic cycles
    pub sync_interval_ms: u64,
    /// Strategy applied to detected conflicts
    pub conflict_resolution: ConflictStrategy,
    /// Retries before a mutation moves to the error list
    pub max_retries: u32,
    /// Mutations per push request
    pub batch_size: usize,
    /// Timeout for a single remote request
    pub request_timeout_ms: u64,
    /// First retry delay after a failed cycle
    pub initial_backoff_ms: u64,
    /// Cap for the retry delay
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            sync_interval_ms: 30_000,
            conflict_resolution: ConflictStrategy::Merge,
            max_retries: 3,
            batch_size: 50,
            request_timeout_ms: 15_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_ms < MIN_SYNC_INTERVAL_MS {
            return Err(ConfigError::IntervalTooShort {
                value: self.sync_interval_ms,
                min: MIN_SYNC_INTERVAL_MS,
            });
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::BatchSize {
                value: self.batch_size,
                max: MAX_BATCH_SIZE,
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::BackoffRange {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        Ok(())
    }

    /// Apply a partial update
    ///
    /// The update is validated as a whole; on error `self` is unchanged.
    pub fn apply(&mut self, patch: &SyncConfigPatch) -> Result<(), ConfigError> {
        let mut next = self.clone();

        if let Some(v) = patch.auto_sync_enabled {
            next.auto_sync_enabled = v;
        }
        if let Some(v) = patch.sync_interval_ms {
            next.sync_interval_ms = v;
        }
        if let Some(v) = patch.conflict_resolution {
            next.conflict_resolution = v;
        }
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = patch.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = patch.request_timeout_ms {
            next.request_timeout_ms = v;
        }
        if let Some(v) = patch.initial_backoff_ms {
            next.initial_backoff_ms = v;
        }
        if let Some(v) = patch.max_backoff_ms {
            next.max_backoff_ms = v;
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial update for [`SyncConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfigPatch {
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_ms: Option<u64>,
    pub conflict_resolution: Option<ConflictStrategy>,
    pub max_retries: Option<u32>,
    pub batch_size: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "PANTRY_DATA_DIR",
        "PANTRY_REMOTE_URL",
        "PANTRY_AUTO_SYNC",
        "PANTRY_SYNC_INTERVAL_MS",
        "PANTRY_CONFLICT_RESOLUTION",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.remote_url.is_none());
        assert!(config.data_dir.ends_with("pantry"));
        assert!(config.sqlite_path().ends_with("pantry.db"));
        assert!(config.sync.validate().is_ok());
        assert_eq!(config.sync.conflict_resolution, ConflictStrategy::Merge);
    }

    #[test]
    fn test_env_override_remote_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("PANTRY_REMOTE_URL", "https://sync.example.com");
        config.apply_env_overrides().unwrap();
        assert_eq!(
            config.remote_url,
            Some("https://sync.example.com".to_string())
        );

        // Empty string clears it
        env::set_var("PANTRY_REMOTE_URL", "");
        config.apply_env_overrides().unwrap();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_env_override_sync_settings() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("PANTRY_AUTO_SYNC", "0");
        env::set_var("PANTRY_SYNC_INTERVAL_MS", "60000");
        env::set_var("PANTRY_CONFLICT_RESOLUTION", "Manual");
        config.apply_env_overrides().unwrap();

        assert!(!config.sync.auto_sync_enabled);
        assert_eq!(config.sync.sync_interval_ms, 60_000);
        assert_eq!(config.sync.conflict_resolution, ConflictStrategy::Manual);
    }

    #[test]
    fn test_env_override_rejects_bad_strategy() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("PANTRY_CONFLICT_RESOLUTION", "coinflip");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            remote_url = "https://api.example.com"

            [sync]
            conflict_resolution = "remote"
            batch_size = 10
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.remote_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.sync.conflict_resolution, ConflictStrategy::Remote);
        assert_eq!(config.sync.batch_size, 10);
        // Unset keys keep their defaults
        assert_eq!(config.sync.max_retries, 3);
    }

    #[test]
    fn test_load_from_str_rejects_invalid_sync() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            [sync]
            batch_size = 0
        "#;
        assert!(Config::load_from_str(toml).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/pantry"),
            remote_url: Some("https://sync.example.com".to_string()),
            log_file: None,
            sync: SyncConfig {
                conflict_resolution: ConflictStrategy::Local,
                ..SyncConfig::default()
            },
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("remote_url"));
        assert!(toml_str.contains("[sync]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.sync, config.sync);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let temp_dir = tempfile::TempDir::new().unwrap();
        env::set_var("PANTRY_DATA_DIR", temp_dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.remote_url.is_none());
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_apply_patch() {
        let mut sync = SyncConfig::default();
        let patch = SyncConfigPatch {
            batch_size: Some(5),
            conflict_resolution: Some(ConflictStrategy::Manual),
            ..Default::default()
        };

        sync.apply(&patch).unwrap();
        assert_eq!(sync.batch_size, 5);
        assert_eq!(sync.conflict_resolution, ConflictStrategy::Manual);
        assert_eq!(sync.max_retries, 3);
    }

    #[test]
    fn test_apply_invalid_patch_keeps_prior_config() {
        let mut sync = SyncConfig::default();
        let before = sync.clone();

        let patch = SyncConfigPatch {
            batch_size: Some(20),
            sync_interval_ms: Some(10),
            ..Default::default()
        };

        let err = sync.apply(&patch).unwrap_err();
        assert!(matches!(err, ConfigError::IntervalTooShort { .. }));
        assert_eq!(sync, before);
    }

    #[test]
    fn test_validate_backoff_range() {
        let sync = SyncConfig {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 5_000,
            ..SyncConfig::default()
        };
        assert!(matches!(
            sync.validate(),
            Err(ConfigError::BackoffRange { .. })
        ));
    }
}
