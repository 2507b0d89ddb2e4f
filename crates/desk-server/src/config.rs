//! Layered configuration.
//!
//! 1. Compiled [`DeskConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. `DESK_*` environment overrides (invalid values are ignored with a warning)
//!
//! CLI flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetrySection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Commands buffered per session actor.
    pub mailbox_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// A connection with no inbound traffic (pongs included) for this long is closed.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            mailbox_capacity: 64,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Attempts per event write before it is parked for a later flush.
    pub retry_attempts: u32,
    /// Initial backoff; doubles after each failed attempt.
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: desk_telemetry::data_dir().join("desk.db"),
            retry_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_to_sqlite: true,
            log_db_path: desk_telemetry::data_dir().join("logs.db"),
        }
    }
}

impl TelemetrySection {
    pub fn to_telemetry_config(&self) -> Result<desk_telemetry::TelemetryConfig, ConfigError> {
        let log_level = self
            .log_level
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("log_level: {}", self.log_level)))?;
        Ok(desk_telemetry::TelemetryConfig {
            log_level,
            module_levels: Vec::new(),
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.log_db_path.clone(),
        })
    }
}

/// `~/.desk/config.json`.
pub fn config_path() -> PathBuf {
    desk_telemetry::data_dir().join("config.json")
}

/// Load from `path` (or the default location) and apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<DeskConfig, ConfigError> {
    match path {
        Some(p) => load_config_from_path(p),
        None => load_config_from_path(&config_path()),
    }
}

/// A missing file yields defaults; an unreadable or invalid one is an error.
pub fn load_config_from_path(path: &Path) -> Result<DeskConfig, ConfigError> {
    let defaults = serde_json::to_value(DeskConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: DeskConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

impl DeskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("server.max_send_queue must be > 0".into()));
        }
        if self.server.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue("server.mailbox_capacity must be > 0".into()));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "server.heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.server.idle_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "server.idle_timeout_secs must be at least the heartbeat interval".into(),
            ));
        }
        if self.storage.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue("storage.retry_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(config: &mut DeskConfig) {
    // server
    if let Some(v) = read_env_string("DESK_HOST") {
        config.server.host = v;
    }
    if let Some(v) = read_env_u16("DESK_PORT", 0, 65535) {
        config.server.port = v;
    }
    if let Some(v) = read_env_usize("DESK_MAX_SEND_QUEUE", 1, 65_536) {
        config.server.max_send_queue = v;
    }
    if let Some(v) = read_env_usize("DESK_MAILBOX_CAPACITY", 1, 65_536) {
        config.server.mailbox_capacity = v;
    }
    if let Some(v) = read_env_u64("DESK_HEARTBEAT_SECS", 1, 3600) {
        config.server.heartbeat_interval_secs = v;
    }

    // storage
    if let Some(v) = read_env_string("DESK_DB_PATH") {
        config.storage.db_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_u64("DESK_STORAGE_RETRIES", 1, 100) {
        config.storage.retry_attempts = v as u32;
    }
    if let Some(v) = read_env_u64("DESK_STORAGE_BACKOFF_MS", 1, 60_000) {
        config.storage.retry_backoff_ms = v;
    }

    // telemetry
    if let Some(v) = read_env_string("DESK_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("DESK_LOG_TO_SQLITE") {
        config.telemetry.log_to_sqlite = v;
    }
    if let Some(v) = read_env_string("DESK_LOG_DB_PATH") {
        config.telemetry.log_db_path = PathBuf::from(v);
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("desk-config-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_are_valid() {
        let config = DeskConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.retry_attempts, 3);
        assert!(config.storage.db_path.ends_with(".desk/desk.db"));
    }

    #[test]
    fn deep_merge_overrides_leaves_and_skips_nulls() {
        let merged = deep_merge(
            json!({"server": {"port": 8000, "host": "0.0.0.0"}, "tags": [1, 2]}),
            json!({"server": {"port": 9000, "host": null}, "tags": [3]}),
        );
        assert_eq!(merged, json!({"server": {"port": 9000, "host": "0.0.0.0"}, "tags": [3]}));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("desk-config-does-not-exist.json");
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.server.mailbox_capacity, 64);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let path = temp_file(r#"{"server": {"mailbox_capacity": 8}, "storage": {"retry_attempts": 5}}"#);
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.server.mailbox_capacity, 8);
        assert_eq!(config.server.max_send_queue, 256);
        assert_eq!(config.storage.retry_attempts, 5);
        assert_eq!(config.storage.retry_backoff_ms, 50);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_file("{not json");
        let err = load_config_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let path = temp_file(r#"{"server": {"max_send_queue": 0}}"#);
        let err = load_config_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("max_send_queue"));
    }

    #[test]
    fn telemetry_level_must_parse() {
        let mut section = TelemetrySection::default();
        assert_eq!(section.to_telemetry_config().unwrap().log_level, tracing::Level::INFO);
        section.log_level = "loud".into();
        assert!(matches!(section.to_telemetry_config(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_usize_range("16", 1, 64), Some(16));
        assert_eq!(parse_usize_range("abc", 1, 64), None);
    }
}
