use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::replica::{TableCatalog, TableSpec};
use crate::settings::{Backoff, SyncSettings};

/// Default shape endpoint of a local Electric instance.
pub const DEFAULT_ELECTRIC_URL: &str = "http://localhost:4027/v1/shape";

/// Session key used when no workspace is configured.
pub const DEFAULT_SESSION_KEY: &str = "default";

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
    /// Bearer token sent to the shape endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Upper bound for a single shape request, long-poll included
    pub request_timeout_secs: u64,
    /// First retry delay after a failed request
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling
    pub max_backoff_secs: u64,
    /// Apply attempts per batch before the table is resynced
    pub apply_attempts: u32,
    /// Consecutive request failures before a table is reported offline
    pub degrade_after_failures: u32,
    /// Database liveness probe timeout
    pub probe_timeout_secs: u64,
    /// How long deleted rows keep blocking late updates
    pub tombstone_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let settings = SyncSettings::default();
        Self {
            api_key: None,
            request_timeout_secs: settings.request_timeout.as_secs(),
            initial_backoff_ms: settings.backoff.initial_delay.as_millis() as u64,
            max_backoff_secs: settings.backoff.max_delay.as_secs(),
            apply_attempts: settings.apply_attempts,
            degrade_after_failures: settings.degrade_after_failures,
            probe_timeout_secs: settings.probe_timeout.as_secs(),
            tombstone_retention_secs: settings.tombstone_retention.as_secs(),
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings::default()
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_backoff(Backoff {
                initial_delay: Duration::from_millis(self.initial_backoff_ms),
                max_delay: Duration::from_secs(self.max_backoff_secs),
                ..Backoff::default()
            })
            .with_apply_attempts(self.apply_attempts)
            .with_degrade_after_failures(self.degrade_after_failures)
            .with_probe_timeout(Duration::from_secs(self.probe_timeout_secs))
            .with_tombstone_retention(Duration::from_secs(self.tombstone_retention_secs))
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the replica database
    pub database_path: ConfigValue<PathBuf>,
    /// Shape endpoint URL
    pub electric_url: ConfigValue<String>,
    /// Workspace whose data is synced; also keys persisted cursors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<ConfigValue<Uuid>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync tuning
    pub sync: SyncConfig,
    /// Replicated tables, replacing the built-in catalog when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableSpec>>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    electric_url: Option<String>,
    workspace_id: Option<String>,
    sync: Option<SyncConfig>,
    tables: Option<Vec<TableSpec>>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("replica.db"),
            ConfigSource::Default,
        );
        let mut electric_url =
            ConfigValue::new(DEFAULT_ELECTRIC_URL.to_string(), ConfigSource::Default);
        let mut workspace_id = None;
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut tables = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(url) = file_config.electric_url {
                electric_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(id) = file_config.workspace_id {
                workspace_id = Some(ConfigValue::new(
                    parse_workspace_id(&id)?,
                    ConfigSource::File,
                ));
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            tables = file_config.tables;
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("MASON_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("MASON_ELECTRIC_URL") {
            electric_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(id) = std::env::var("MASON_WORKSPACE_ID") {
            workspace_id = Some(ConfigValue::new(
                parse_workspace_id(&id)?,
                ConfigSource::Environment,
            ));
        }
        if let Ok(key) = std::env::var("MASON_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            electric_url,
            workspace_id,
            config_file,
            sync,
            tables,
        })
    }

    /// Key under which cursors and status are persisted.
    pub fn session_key(&self) -> String {
        self.workspace_id
            .as_ref()
            .map(|id| id.value.to_string())
            .unwrap_or_else(|| DEFAULT_SESSION_KEY.to_string())
    }

    /// The configured table catalog, or the built-in one.
    pub fn catalog(&self) -> Result<TableCatalog, ConfigError> {
        match &self.tables {
            Some(tables) => TableCatalog::new(tables.clone())
                .map_err(|e| ConfigError::InvalidValue("tables".to_string(), e.to_string())),
            None => Ok(TableCatalog::mason()),
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/mason/
    /// - macOS: ~/Library/Application Support/mason/
    /// - Windows: %APPDATA%/mason/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mason")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/mason/
    /// - macOS: ~/Library/Application Support/mason/
    /// - Windows: %APPDATA%/mason/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mason")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn parse_workspace_id(value: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(value.trim())
        .map_err(|e| ConfigError::InvalidValue("workspace_id".to_string(), e.to_string()))
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(key, e) => {
                write!(f, "Invalid value for '{}': {}", key, e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
