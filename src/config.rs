use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_APP_NAME: &str = "sitebuilder";
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bearer token sent with every request, if the backend wants one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Drain the outbox automatically after writes and on reconnect
    pub auto_sync: bool,
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Permanent rejections tolerated before an entry is dead-lettered
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            auto_sync: true,
            refresh_interval_secs: 60,
            request_timeout_secs: 10,
            max_attempts: 5,
        }
    }
}

impl SyncConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Base URL of the document API
    pub server_url: ConfigValue<String>,
    /// Prefix of every remote resource (`{app}_{collection}`)
    pub app_name: ConfigValue<String>,
    /// Caller identity sent as `x-client-id`
    pub client_id: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    server_url: Option<String>,
    app_name: Option<String>,
    client_id: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config.apply_file(&path, file_config);
            config.config_file = Some(path);
        }

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Built-in defaults, with no file or environment applied.
    pub fn defaults() -> Self {
        Self {
            database_path: ConfigValue::new(
                Self::default_data_dir().join("sitesync.db"),
                ConfigSource::Default,
            ),
            server_url: ConfigValue::new(DEFAULT_SERVER_URL.to_string(), ConfigSource::Default),
            app_name: ConfigValue::new(DEFAULT_APP_NAME.to_string(), ConfigSource::Default),
            client_id: ConfigValue::new(DEFAULT_CLIENT_ID.to_string(), ConfigSource::Default),
            config_file: None,
            sync: SyncConfig::default(),
        }
    }

    fn apply_file(&mut self, path: &std::path::Path, file_config: ConfigFile) {
        if let Some(db_path) = file_config.database_path {
            // Resolve relative paths against config file's directory
            let resolved_path = if db_path.is_relative() {
                path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
            } else {
                db_path
            };
            self.database_path = ConfigValue::new(resolved_path, ConfigSource::File);
        }
        if let Some(url) = file_config.server_url {
            self.server_url = ConfigValue::new(url, ConfigSource::File);
        }
        if let Some(app) = file_config.app_name {
            self.app_name = ConfigValue::new(app, ConfigSource::File);
        }
        if let Some(client_id) = file_config.client_id {
            self.client_id = ConfigValue::new(client_id, ConfigSource::File);
        }
        if let Some(sync) = file_config.sync {
            self.sync = sync;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(db_path) = std::env::var("SITESYNC_DATABASE_PATH") {
            self.database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("SITESYNC_SERVER_URL") {
            self.server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(app) = std::env::var("SITESYNC_APP_NAME") {
            self.app_name = ConfigValue::new(app, ConfigSource::Environment);
        }
        if let Ok(client_id) = std::env::var("SITESYNC_CLIENT_ID") {
            self.client_id = ConfigValue::new(client_id, ConfigSource::Environment);
        }
        if let Ok(key) = std::env::var("SITESYNC_API_KEY") {
            self.sync.api_key = Some(key);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server_url.value.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "server_url",
                reason: format!("'{}' is not an http(s) URL", url),
            });
        }
        if self.app_name.value.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "app_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.client_id.value.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "client_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/sitesync/
    /// - macOS: ~/Library/Application Support/sitesync/
    /// - Windows: %APPDATA%/sitesync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sitesync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/sitesync/
    /// - macOS: ~/Library/Application Support/sitesync/
    /// - Windows: %APPDATA%/sitesync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sitesync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    ReadError(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, serde_yaml::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("sitesync.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.app_name.value, "sitebuilder");
        assert_eq!(config.app_name.source, ConfigSource::Default);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.refresh_interval(), Duration::from_secs(60));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/db.sqlite").unwrap();
        writeln!(file, "server_url: https://api.example.com/v1").unwrap();
        writeln!(file, "app_name: demo").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  auto_sync: false").unwrap();
        writeln!(file, "  max_attempts: 2").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/db.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.server_url.value, "https://api.example.com/v1");
        assert_eq!(config.app_name.value, "demo");
        assert_eq!(config.app_name.source, ConfigSource::File);
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.max_attempts, 2);
        // Unset sync fields keep their defaults
        assert_eq!(config.sync.request_timeout_secs, 10);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/site.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/site.db")
        );
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "client_id: fromfile").unwrap();

        std::env::set_var("SITESYNC_CLIENT_ID", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.client_id.value, "fromenv");
        assert_eq!(config.client_id.source, ConfigSource::Environment);

        std::env::remove_var("SITESYNC_CLIENT_ID");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_rejects_non_http_server_url() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: ws://localhost:8080").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "server_url", .. }));
    }

    #[test]
    fn test_rejects_zero_max_attempts() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  max_attempts: 0").unwrap();

        assert!(Config::load(Some(config_path)).is_err());
    }
}
