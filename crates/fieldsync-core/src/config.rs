//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/fieldsync/config.toml)
//! 3. Environment variables (FIELDSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::network::FlapSettings;
use crate::retry::RetryPolicy;
use crate::sync::SyncSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "FIELDSYNC";

/// Backoff settings for propagation retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Propagation attempts per save or queued push, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single delay
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            max_delay_ms: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (records, pending queue, device id)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Shared remote file; defaults to `<data_dir>/remote.db`
    #[serde(default)]
    pub remote_path: Option<PathBuf>,

    /// Whether the engine syncs on its own (interval and reconnect)
    #[serde(default)]
    pub sync_enabled: bool,

    /// Treat the network as offline regardless of reachability
    #[serde(default)]
    pub force_offline: bool,

    /// Log file path (logs go to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound on a single push or pull attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_pull_batch_size")]
    pub pull_batch_size: usize,

    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,

    /// Seconds between automatic sync passes; 0 disables the timer
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Seconds between reachability checks; 0 disables polling
    #[serde(default = "default_reachability_poll_secs")]
    pub reachability_poll_secs: u64,

    #[serde(default = "default_flap_window_secs")]
    pub flap_window_secs: u64,

    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_path: None,
            sync_enabled: false,
            force_offline: false,
            log_file: None,
            retry: RetryConfig::default(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            pull_batch_size: default_pull_batch_size(),
            push_batch_size: default_push_batch_size(),
            sync_interval_secs: default_sync_interval_secs(),
            reachability_poll_secs: default_reachability_poll_secs(),
            flap_window_secs: default_flap_window_secs(),
            flap_threshold: default_flap_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (FIELDSYNC_DATA_DIR, FIELDSYNC_REMOTE_PATH, ...)
    /// 2. Config file (~/.config/fieldsync/config.toml or FIELDSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(cli_path: Option<&PathBuf>) -> Result<Self> {
        match cli_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
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
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_REMOTE_PATH", ENV_PREFIX)) {
            self.remote_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = parse_flag(&val);
        }

        if let Ok(val) = std::env::var(format!("{}_FORCE_OFFLINE", ENV_PREFIX)) {
            self.force_offline = parse_flag(&val);
        }

        if let Ok(val) = std::env::var(format!("{}_MAX_ATTEMPTS", ENV_PREFIX)) {
            self.retry.max_attempts = val
                .parse()
                .with_context(|| format!("Invalid {}_MAX_ATTEMPTS: {:?}", ENV_PREFIX, val))?;
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

    /// Get the config file path
    ///
    /// Can be overridden with FIELDSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldsync")
            .join("config.toml")
    }

    /// Path to the local records database
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }

    /// Path to the pending change queue
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    /// Path to the device id file
    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    /// Path to the shared remote file
    pub fn remote_path(&self) -> PathBuf {
        self.remote_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("remote.db"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            self.retry.max_attempts,
        );
        match self.retry.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            pull_batch_size: self.pull_batch_size.max(1),
            push_batch_size: self.push_batch_size.max(1),
        }
    }

    pub fn flap_settings(&self) -> FlapSettings {
        FlapSettings {
            window: Duration::from_secs(self.flap_window_secs),
            threshold: self.flap_threshold.max(1),
        }
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn reachability_poll_interval(&self) -> Option<Duration> {
        (self.reachability_poll_secs > 0).then(|| Duration::from_secs(self.reachability_poll_secs))
    }
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_pull_batch_size() -> usize {
    50
}

fn default_push_batch_size() -> usize {
    25
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_reachability_poll_secs() -> u64 {
    15
}

fn default_flap_window_secs() -> u64 {
    30
}

fn default_flap_threshold() -> usize {
    4
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
            let lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
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
        "FIELDSYNC_DATA_DIR",
        "FIELDSYNC_REMOTE_PATH",
        "FIELDSYNC_SYNC_ENABLED",
        "FIELDSYNC_FORCE_OFFLINE",
        "FIELDSYNC_MAX_ATTEMPTS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(!config.force_offline);
        assert!(config.remote_path.is_none());
        assert!(config.data_dir.ends_with("fieldsync"));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_file_paths() {
        let config = Config {
            data_dir: PathBuf::from("/data/fs"),
            ..Config::default()
        };

        assert_eq!(config.store_path(), PathBuf::from("/data/fs/records.db"));
        assert_eq!(config.queue_path(), PathBuf::from("/data/fs/queue.db"));
        assert_eq!(config.device_id_path(), PathBuf::from("/data/fs/device_id"));
        assert_eq!(config.remote_path(), PathBuf::from("/data/fs/remote.db"));

        let shared = Config {
            remote_path: Some(PathBuf::from("/shared/cloud.db")),
            ..config
        };
        assert_eq!(shared.remote_path(), PathBuf::from("/shared/cloud.db"));
    }

    #[test]
    fn test_default_retry_policy_schedule() {
        let policy = Config::default().retry_policy();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_retry_max_delay_is_applied() {
        let mut config = Config::default();
        config.retry.max_attempts = 5;
        config.retry.max_delay_ms = Some(3000);

        let schedule = config.retry_policy().schedule();
        assert_eq!(schedule.len(), 5);
        assert!(schedule.iter().all(|d| *d <= Duration::from_secs(3)));
    }

    #[test]
    fn test_zero_intervals_disable_timers() {
        let config = Config {
            sync_interval_secs: 0,
            reachability_poll_secs: 0,
            ..Config::default()
        };
        assert!(config.sync_interval().is_none());
        assert!(config.reachability_poll_interval().is_none());
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("FIELDSYNC_DATA_DIR", "/tmp/fieldsync-test");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/fieldsync-test"));
    }

    #[test]
    fn test_env_override_flags() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("FIELDSYNC_SYNC_ENABLED", "true");
        env::set_var("FIELDSYNC_FORCE_OFFLINE", "1");
        config.apply_env_overrides().unwrap();
        assert!(config.sync_enabled);
        assert!(config.force_offline);

        env::set_var("FIELDSYNC_SYNC_ENABLED", "false");
        env::set_var("FIELDSYNC_FORCE_OFFLINE", "no");
        config.apply_env_overrides().unwrap();
        assert!(!config.sync_enabled);
        assert!(!config.force_offline);
    }

    #[test]
    fn test_env_override_remote_path() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("FIELDSYNC_REMOTE_PATH", "/shared/remote.db");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.remote_path, Some(PathBuf::from("/shared/remote.db")));

        env::set_var("FIELDSYNC_REMOTE_PATH", "");
        config.apply_env_overrides().unwrap();
        assert!(config.remote_path.is_none());
    }

    #[test]
    fn test_env_override_max_attempts() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("FIELDSYNC_MAX_ATTEMPTS", "7");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.retry.max_attempts, 7);

        env::set_var("FIELDSYNC_MAX_ATTEMPTS", "many");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/fieldsync"),
            remote_path: Some(PathBuf::from("/shared/remote.db")),
            sync_enabled: true,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("[retry]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            sync_enabled = true
            pull_batch_size = 10

            [retry]
            base_delay_ms = 250
            max_attempts = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert!(config.sync_enabled);
        assert_eq!(config.sync_settings().pull_batch_size, 10);
        assert_eq!(config.sync_settings().push_batch_size, 25);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        env::set_var("FIELDSYNC_DATA_DIR", temp_dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            force_offline: true,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_with_cli_override(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }
}
