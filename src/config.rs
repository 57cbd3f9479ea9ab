//! Service configuration.
//!
//! Loaded from TOML, every section optional, then overridden by `RESILIENCE_*` environment
//! variables:
//!
//! ```toml
//! service_name = "checkout-resilience"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 9090
//!
//! [cache]
//! capacity = 500
//! ttl_ms = 60000
//!
//! [logging]
//! level = "debug"
//! format = "text"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FieldViolation;
use crate::repository::{CacheConfig, DEFAULT_KEY_PREFIX};
use crate::service::DEFAULT_WATCH_BUFFER;

pub const ENV_PREFIX: &str = "RESILIENCE_";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment variable {key}={value:?} is not a valid {expected}")]
    Env { key: String, value: String, expected: &'static str },
    #[error("invalid config: {}", format_violations(.0))]
    Invalid(Vec<FieldViolation>),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_name: String,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cache: CacheSection,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "resilience-service".to_string(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            cache: CacheSection::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 9090, shutdown_timeout_ms: 10_000 }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { key_prefix: DEFAULT_KEY_PREFIX.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub capacity: usize,
    /// Zero disables expiry.
    pub ttl_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { capacity: 1000, ttl_ms: 300_000 }
    }
}

impl From<CacheSection> for CacheConfig {
    fn from(c: CacheSection) -> Self {
        CacheConfig {
            capacity: c.capacity,
            ttl: (c.ttl_ms > 0).then(|| Duration::from_millis(c.ttl_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub buffer: usize,
    pub enabled: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { buffer: DEFAULT_WATCH_BUFFER, enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Json }
    }
}

impl ServiceConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `RESILIENCE_*` overrides from `vars`. Unrelated keys are ignored.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.into();
            match name {
                "SERVICE_NAME" => self.service_name = value,
                "SERVER_HOST" => self.server.host = value,
                "SERVER_PORT" => self.server.port = parse_env(key.as_ref(), &value, "port number")?,
                "CACHE_CAPACITY" => self.cache.capacity = parse_env(key.as_ref(), &value, "cache capacity")?,
                "CACHE_TTL_MS" => self.cache.ttl_ms = parse_env(key.as_ref(), &value, "duration in milliseconds")?,
                "STORE_KEY_PREFIX" => self.store.key_prefix = value,
                "WATCH_BUFFER" => self.watch.buffer = parse_env(key.as_ref(), &value, "buffer size")?,
                "WATCH_ENABLED" => self.watch.enabled = parse_env(key.as_ref(), &value, "boolean")?,
                "LOGGING_LEVEL" => self.logging.level = value.to_ascii_lowercase(),
                "LOGGING_FORMAT" => {
                    self.logging.format = value.parse().map_err(|()| ConfigError::Env {
                        key: key.as_ref().to_string(),
                        value: value.clone(),
                        expected: "log format (json|text)",
                    })?
                }
                _ => tracing::debug!(key = key.as_ref(), "ignoring unknown config override"),
            }
        }
        Ok(())
    }

    /// Report every invalid field at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();
        if self.service_name.trim().is_empty() {
            violations.push(FieldViolation::new("service_name", "\"\"", "non-empty"));
        }
        if self.server.port == 0 {
            violations.push(FieldViolation::new("server.port", "0", ">= 1"));
        }
        if self.store.key_prefix.is_empty() {
            violations.push(FieldViolation::new("store.key_prefix", "\"\"", "non-empty"));
        }
        if self.cache.capacity == 0 {
            violations.push(FieldViolation::new("cache.capacity", "0", ">= 1"));
        }
        if self.watch.buffer == 0 {
            violations.push(FieldViolation::new("watch.buffer", "0", ">= 1"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            violations.push(FieldViolation::new(
                "logging.level",
                format!("{:?}", self.logging.level),
                format!("one of {}", LOG_LEVELS.join("|")),
            ));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.into()
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.cache_config(), CacheConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ServiceConfig::from_toml_str(
            r#"
            service_name = "checkout"
            [cache]
            ttl_ms = 0
            [logging]
            format = "text"
            "#,
        )
        .unwrap();
        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache_config().ttl, None);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn env_overrides_win() {
        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides([
                ("RESILIENCE_SERVER_PORT", "7070"),
                ("RESILIENCE_WATCH_ENABLED", "false"),
                ("RESILIENCE_LOGGING_FORMAT", "TEXT"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();
        assert_eq!(config.server.port, 7070);
        assert!(!config.watch.enabled);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn bad_env_value_names_the_key() {
        let mut config = ServiceConfig::default();
        let err = config.apply_env_overrides([("RESILIENCE_SERVER_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("RESILIENCE_SERVER_PORT"), "{err}");
    }

    #[test]
    fn validate_reports_every_violation() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        config.watch.buffer = 0;
        config.logging.level = "loud".into();
        match config.validate().unwrap_err() {
            ConfigError::Invalid(violations) => {
                let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
                assert_eq!(fields, vec!["server.port", "watch.buffer", "logging.level"]);
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }
}
