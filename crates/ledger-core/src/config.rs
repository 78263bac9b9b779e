//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/ledger/config.toml)
//! 3. Environment variables (LEDGER_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::{RetryPolicy, SyncTaskConfig};

/// Environment variable prefix
const ENV_PREFIX: &str = "LEDGER";

/// Default LocalStorage quota (5 MiB)
const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Backend used for the local (primary) adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalBackend {
    /// One JSON file per collection
    LocalStorage,
    /// SQLite object stores
    #[default]
    IndexedDb,
}

impl fmt::Display for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalBackend::LocalStorage => f.write_str("local_storage"),
            LocalBackend::IndexedDb => f.write_str("indexed_db"),
        }
    }
}

impl FromStr for LocalBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local_storage" => Ok(LocalBackend::LocalStorage),
            "indexed_db" => Ok(LocalBackend::IndexedDb),
            other => bail!(
                "Unknown local backend '{}'. Expected local_storage or indexed_db.",
                other
            ),
        }
    }
}

/// Sync queue and background task settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts before a queued entry is parked as failed
    pub max_attempts: u32,
    /// First retry delay
    pub initial_backoff_ms: u64,
    /// Retry delay cap
    pub max_backoff_ms: u64,
    /// Interval between pulls from the remote
    pub pull_interval_secs: u64,
    /// HTTP request timeout for the remote
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            pull_interval_secs: 30,
            request_timeout_secs: 15,
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn task_config(&self) -> SyncTaskConfig {
        SyncTaskConfig {
            pull_interval: (self.pull_interval_secs > 0)
                .then(|| Duration::from_secs(self.pull_interval_secs)),
            ..SyncTaskConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (local datasets, SQLite db, sync queue)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Backend for the local adapter
    #[serde(default)]
    pub local_backend: LocalBackend,

    /// Byte quota for the local_storage backend
    #[serde(default = "default_quota")]
    pub storage_quota_bytes: u64,

    /// Remote API base URL (optional)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Whether sync with the remote is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Active user for selective sync rules
    #[serde(default)]
    pub user_id: Option<String>,

    /// Log file path; logs go to stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Default log level (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            local_backend: LocalBackend::default(),
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
            remote_url: None,
            sync_enabled: false,
            user_id: None,
            log_file: None,
            log_level: default_log_level(),
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LEDGER_DATA_DIR, LEDGER_REMOTE_URL, ...)
    /// 2. Config file (~/.config/ledger/config.toml or LEDGER_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // LEDGER_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // LEDGER_REMOTE_URL
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        // LEDGER_SYNC_ENABLED
        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = parse_bool(&val);
        }

        // LEDGER_USER_ID
        if let Ok(val) = std::env::var(format!("{}_USER_ID", ENV_PREFIX)) {
            self.user_id = if val.is_empty() { None } else { Some(val) };
        }

        // LEDGER_LOCAL_BACKEND
        if let Ok(val) = std::env::var(format!("{}_LOCAL_BACKEND", ENV_PREFIX)) {
            self.local_backend = val
                .parse()
                .with_context(|| format!("Invalid {}_LOCAL_BACKEND", ENV_PREFIX))?;
        }

        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Set a single key from its string form (`ledger config set`)
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "local_backend" => self.local_backend = value.parse()?,
            "storage_quota_bytes" => {
                self.storage_quota_bytes = value.parse().context("Expected a byte count")?
            }
            "remote_url" => self.remote_url = optional(value),
            "sync_enabled" => self.sync_enabled = parse_bool(value),
            "user_id" => self.user_id = optional(value),
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            "log_level" => self.log_level = value.to_string(),
            "sync.max_attempts" => {
                self.sync.max_attempts = value.parse().context("Expected a number")?
            }
            "sync.initial_backoff_ms" => {
                self.sync.initial_backoff_ms = value.parse().context("Expected milliseconds")?
            }
            "sync.max_backoff_ms" => {
                self.sync.max_backoff_ms = value.parse().context("Expected milliseconds")?
            }
            "sync.pull_interval_secs" => {
                self.sync.pull_interval_secs = value.parse().context("Expected seconds")?
            }
            "sync.request_timeout_secs" => {
                self.sync.request_timeout_secs = value.parse().context("Expected seconds")?
            }
            other => bail!("Unknown config key '{}'", other),
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LEDGER_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ledger")
            .join("config.toml")
    }

    /// Directory backing the local_storage backend
    pub fn local_storage_dir(&self) -> PathBuf {
        self.data_dir.join("local")
    }

    /// SQLite file backing the indexed_db backend
    pub fn indexed_db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn sync_queue_path(&self) -> PathBuf {
        self.data_dir.join("sync_queue.json")
    }

    pub fn conflict_log_path(&self) -> PathBuf {
        self.data_dir.join("conflicts.json")
    }

    pub fn sync_rules_path(&self) -> PathBuf {
        self.data_dir.join("sync_rules.json")
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ledger")
}

fn default_quota() -> u64 {
    DEFAULT_QUOTA_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

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
            // Clear all the vars
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
        "LEDGER_DATA_DIR",
        "LEDGER_REMOTE_URL",
        "LEDGER_SYNC_ENABLED",
        "LEDGER_USER_ID",
        "LEDGER_LOCAL_BACKEND",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
        assert_eq!(config.local_backend, LocalBackend::IndexedDb);
        assert_eq!(config.storage_quota_bytes, 5 * 1024 * 1024);
        assert!(config.data_dir.ends_with("ledger"));
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.pull_interval_secs, 30);
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();

        assert!(config.local_storage_dir().ends_with("local"));
        assert!(config.indexed_db_path().ends_with("ledger.db"));
        assert!(config.sync_queue_path().ends_with("sync_queue.json"));
        assert!(config.conflict_log_path().ends_with("conflicts.json"));
        assert!(config.sync_rules_path().ends_with("sync_rules.json"));
    }

    #[test]
    fn test_sync_settings_conversions() {
        let settings = SyncSettings {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            pull_interval_secs: 0,
            request_timeout_secs: 5,
        };

        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert!(settings.task_config().pull_interval.is_none());
        assert_eq!(settings.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LEDGER_DATA_DIR", "/tmp/ledger-test");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/ledger-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(!config.sync_enabled);

        env::set_var("LEDGER_SYNC_ENABLED", "true");
        config.apply_env_overrides().unwrap();
        assert!(config.sync_enabled);

        env::set_var("LEDGER_SYNC_ENABLED", "1");
        config.sync_enabled = false;
        config.apply_env_overrides().unwrap();
        assert!(config.sync_enabled);

        env::set_var("LEDGER_SYNC_ENABLED", "false");
        config.apply_env_overrides().unwrap();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_remote_and_user() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LEDGER_REMOTE_URL", "https://erp.example.com/api");
        env::set_var("LEDGER_USER_ID", "u42");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("https://erp.example.com/api"));
        assert_eq!(config.user_id.as_deref(), Some("u42"));

        // Empty string clears it
        env::set_var("LEDGER_REMOTE_URL", "");
        config.apply_env_overrides().unwrap();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_env_override_backend() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("LEDGER_LOCAL_BACKEND", "local_storage");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.local_backend, LocalBackend::LocalStorage);

        env::set_var("LEDGER_LOCAL_BACKEND", "floppy");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/ledger"),
            remote_url: Some("https://erp.example.com/api".to_string()),
            sync_enabled: true,
            local_backend: LocalBackend::LocalStorage,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("remote_url"));
        assert!(toml_str.contains("local_backend = \"local_storage\""));
        assert!(toml_str.contains("[sync]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            remote_url = "https://erp.example.com/api"
            sync_enabled = true

            [sync]
            max_attempts = 8
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.remote_url.as_deref(), Some("https://erp.example.com/api"));
        assert!(config.sync_enabled);
        assert_eq!(config.sync.max_attempts, 8);
        // Unspecified keys keep their defaults
        assert_eq!(config.sync.max_backoff_ms, 60_000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("LEDGER_DATA_DIR", temp_dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_set_value_and_save() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.set_value("remote_url", "https://erp.example.com/api").unwrap();
        config.set_value("sync.max_attempts", "9").unwrap();
        config.set_value("local_backend", "local_storage").unwrap();
        assert!(config.set_value("sync.max_attempts", "many").is_err());
        assert!(config.set_value("colour", "blue").is_err());

        config.save_to_path(&path).unwrap();
        let reloaded = Config::load_from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.sync.max_attempts, 9);
        assert_eq!(reloaded.local_backend, LocalBackend::LocalStorage);
        assert_eq!(reloaded.remote_url, config.remote_url);
    }
}
