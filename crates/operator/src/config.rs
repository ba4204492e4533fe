use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "COMPOSITE_OPERATOR_CONFIG";
pub const NAMESPACE_ENV: &str = "COMPOSITE_OPERATOR_NAMESPACE";
pub const CONCURRENCY_ENV: &str = "COMPOSITE_OPERATOR_MAX_CONCURRENCY";
pub const METRICS_ADDR_ENV: &str = "COMPOSITE_OPERATOR_METRICS_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// On-disk shape; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    namespace: Option<String>,
    max_concurrent_reconciles: Option<u16>,
    metrics_addr: Option<String>,
    resync_interval: Option<String>,
    retry_interval: Option<String>,
    error_backoff: Option<String>,
    reporter: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Watch a single namespace; all namespaces when unset.
    pub namespace: Option<String>,
    pub max_concurrent_reconciles: u16,
    pub metrics_addr: SocketAddr,
    /// Requeue delay after a converged pass.
    pub resync_interval: Duration,
    /// Requeue delay after a status write conflict.
    pub retry_interval: Duration,
    /// Requeue delay after a failed pass.
    pub error_backoff: Duration,
    /// Controller name on published events.
    pub reporter: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            max_concurrent_reconciles: 10,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            resync_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(30),
            reporter: "composite-operator".into(),
        }
    }
}

impl OperatorConfig {
    /// Load from `path` (or `$COMPOSITE_OPERATOR_CONFIG`), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let file = match path {
            Some(path) => {
                debug!(path=%path.display(), "config.load.attempt");
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                Self::parse(&raw).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn parse(raw: &str) -> Result<FileConfig, toml::de::Error> { toml::from_str(raw) }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let namespace = env(NAMESPACE_ENV).or(file.namespace).filter(|ns| !ns.is_empty());
        let max_concurrent_reconciles = match env(CONCURRENCY_ENV) {
            Some(raw) => raw.trim().parse().map_err(|e| invalid("max_concurrent_reconciles", format!("{raw:?}: {e}")))?,
            None => file.max_concurrent_reconciles.unwrap_or(defaults.max_concurrent_reconciles),
        };
        if max_concurrent_reconciles == 0 { return Err(invalid("max_concurrent_reconciles", "must be at least 1")); }
        let metrics_addr = match env(METRICS_ADDR_ENV).or(file.metrics_addr) {
            Some(raw) => raw.trim().parse().map_err(|e| invalid("metrics_addr", format!("{raw:?}: {e}")))?,
            None => defaults.metrics_addr,
        };
        Ok(Self {
            namespace,
            max_concurrent_reconciles,
            metrics_addr,
            resync_interval: duration("resync_interval", file.resync_interval, defaults.resync_interval)?,
            retry_interval: duration("retry_interval", file.retry_interval, defaults.retry_interval)?,
            error_backoff: duration("error_backoff", file.error_backoff, defaults.error_backoff)?,
            reporter: file.reporter.filter(|r| !r.is_empty()).unwrap_or(defaults.reporter),
        })
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError { ConfigError::Invalid { field, message: message.into() } }

fn duration(field: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match raw {
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| invalid(field, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}
