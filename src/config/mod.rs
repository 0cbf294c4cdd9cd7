//! Configuration loading for the stream ingestion service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `STREAM_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "STREAM_";

/// Application configuration derived from `STREAM_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_file_sink_dir")]
    pub file_sink_dir: PathBuf,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub limits: DefinitionLimits,
}

/// Backing store of the definition repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// SQL database through SeaORM (Postgres or SQLite).
    Sql,
    /// Process-local store; definitions are lost on restart.
    Memory,
}

/// Key-value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct KvConfig {
    #[serde(default = "default_kv_backend")]
    pub backend: KvBackend,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// How often SQL watchers poll the change log.
    #[serde(default = "default_kv_watch_poll_interval_ms")]
    pub watch_poll_interval_ms: u64,
    /// Number of revisions kept in the change log before compaction.
    #[serde(default = "default_kv_change_retention")]
    pub change_retention: i64,
    /// Upper bound of attempts of one atomic operation under write conflicts.
    #[serde(default = "default_kv_max_atomic_attempts")]
    pub max_atomic_attempts: u32,
}

/// Count quotas enforced by the definition repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DefinitionLimits {
    #[serde(default = "default_max_branches_per_project")]
    pub max_branches_per_project: usize,
    #[serde(default = "default_max_sources_per_branch")]
    pub max_sources_per_branch: usize,
    #[serde(default = "default_max_sinks_per_source")]
    pub max_sinks_per_source: usize,
    #[serde(default = "default_max_versions_per_entity")]
    pub max_versions_per_entity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            operator_tokens: Vec::new(),
            max_body_size: default_max_body_size(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            file_sink_dir: default_file_sink_dir(),
            kv: KvConfig::default(),
            limits: DefinitionLimits::default(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: default_kv_backend(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            watch_poll_interval_ms: default_kv_watch_poll_interval_ms(),
            change_retention: default_kv_change_retention(),
            max_atomic_attempts: default_kv_max_atomic_attempts(),
        }
    }
}

impl Default for DefinitionLimits {
    fn default() -> Self {
        Self {
            max_branches_per_project: default_max_branches_per_project(),
            max_sources_per_branch: default_max_sources_per_branch(),
            max_sinks_per_source: default_max_sinks_per_source(),
            max_versions_per_entity: default_max_versions_per_entity(),
        }
    }
}

impl KvConfig {
    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }

    /// Validate key-value store configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == KvBackend::Sql && self.database_url.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.watch_poll_interval_ms == 0 || self.watch_poll_interval_ms > 60_000 {
            return Err(ConfigError::InvalidWatchPollInterval {
                value: self.watch_poll_interval_ms,
            });
        }
        if self.change_retention < 100 {
            return Err(ConfigError::InvalidChangeRetention {
                value: self.change_retention,
            });
        }
        if self.max_atomic_attempts == 0 {
            return Err(ConfigError::InvalidMaxAtomicAttempts);
        }
        Ok(())
    }
}

impl DefinitionLimits {
    /// Validate that every quota allows at least one entity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max branches per project", self.max_branches_per_project),
            ("max sources per branch", self.max_sources_per_branch),
            ("max sinks per source", self.max_sinks_per_source),
            ("max versions per entity", self.max_versions_per_entity),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidLimit {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if let Some(at) = config.kv.database_url.find('@') {
            // Keep the scheme, drop the credentials.
            let scheme_end = config.kv.database_url.find("://").map_or(0, |i| i + 3);
            config
                .kv
                .database_url
                .replace_range(scheme_end..at, "[REDACTED]");
        }
        serde_json::to_string_pretty(&config)
    }

    /// Local and test profiles without tokens run the definition API unauthenticated.
    pub fn operator_auth_required(&self) -> bool {
        !(self.operator_tokens.is_empty() && matches!(self.profile.as_str(), "local" | "test"))
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_auth_required() && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.max_body_size == 0 {
            return Err(ConfigError::InvalidMaxBodySize);
        }

        self.kv.validate()?;
        self.limits.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_file_sink_dir() -> PathBuf {
    PathBuf::from("data/sinks")
}

fn default_kv_backend() -> KvBackend {
    KvBackend::Sql
}

fn default_database_url() -> String {
    "sqlite://stream.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_kv_watch_poll_interval_ms() -> u64 {
    200
}

fn default_kv_change_retention() -> i64 {
    10_000
}

fn default_kv_max_atomic_attempts() -> u32 {
    50
}

fn default_max_branches_per_project() -> usize {
    100
}

fn default_max_sources_per_branch() -> usize {
    100
}

fn default_max_sinks_per_source() -> usize {
    100
}

fn default_max_versions_per_entity() -> usize {
    1000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' of {key}")]
    InvalidValue { key: String, value: String },
    #[error("no operator tokens configured; set STREAM_OPERATOR_TOKEN or STREAM_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("max body size must be positive")]
    InvalidMaxBodySize,
    #[error("database url is missing; set STREAM_DATABASE_URL or STREAM_KV_BACKEND=memory")]
    MissingDatabaseUrl,
    #[error("kv watch poll interval must be between 1 and 60000 ms, got {value}")]
    InvalidWatchPollInterval { value: u64 },
    #[error("kv change retention must be at least 100 revisions, got {value}")]
    InvalidChangeRetention { value: i64 },
    #[error("kv max atomic attempts must be positive")]
    InvalidMaxAtomicAttempts,
    #[error("{field} must be positive")]
    InvalidLimit { field: String },
}

/// Loads configuration using layered `.env` files and `STREAM_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: `.env` files first, then the process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let max_body_size =
            take_parsed(&mut layered, "MAX_BODY_SIZE")?.unwrap_or_else(default_max_body_size);
        let shutdown_timeout_seconds = take_parsed(&mut layered, "SHUTDOWN_TIMEOUT_SECONDS")?
            .unwrap_or_else(default_shutdown_timeout_seconds);
        let file_sink_dir = take_string(&mut layered, "FILE_SINK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_file_sink_dir);

        let backend = match take_string(&mut layered, "KV_BACKEND").as_deref() {
            None | Some("sql") => KvBackend::Sql,
            Some("memory") => KvBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}KV_BACKEND"),
                    value: other.to_string(),
                });
            }
        };

        let kv = KvConfig {
            backend,
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            watch_poll_interval_ms: take_parsed(&mut layered, "KV_WATCH_POLL_INTERVAL_MS")?
                .unwrap_or_else(default_kv_watch_poll_interval_ms),
            change_retention: take_parsed(&mut layered, "KV_CHANGE_RETENTION")?
                .unwrap_or_else(default_kv_change_retention),
            max_atomic_attempts: take_parsed(&mut layered, "KV_MAX_ATOMIC_ATTEMPTS")?
                .unwrap_or_else(default_kv_max_atomic_attempts),
        };

        let limits = DefinitionLimits {
            max_branches_per_project: take_parsed(&mut layered, "MAX_BRANCHES_PER_PROJECT")?
                .unwrap_or_else(default_max_branches_per_project),
            max_sources_per_branch: take_parsed(&mut layered, "MAX_SOURCES_PER_BRANCH")?
                .unwrap_or_else(default_max_sources_per_branch),
            max_sinks_per_source: take_parsed(&mut layered, "MAX_SINKS_PER_SOURCE")?
                .unwrap_or_else(default_max_sinks_per_source),
            max_versions_per_entity: take_parsed(&mut layered, "MAX_VERSIONS_PER_ENTITY")?
                .unwrap_or_else(default_max_versions_per_entity),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            operator_tokens,
            max_body_size,
            shutdown_timeout_seconds,
            file_sink_dir,
            kv,
            limits,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(values, key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
    }
}
