use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

/// Prefix of environment variables merged over the file configuration.
pub const ENV_PREFIX: &str = "IDGATE_";

/// Upper bound for `timeout_ms` (ten minutes).
pub const MAX_TIMEOUT_MS: u64 = 600_000;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Output format of log lines written to stderr and the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive (defaults to `info`; `RUST_LOG` wins when set).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Line format (defaults to `text`).
    #[serde(default)]
    pub format: LogFormat,
    /// Optional file that receives a copy of every log line, rotated daily.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The upstream JSON-RPC endpoint. Also the token audience.
    #[serde(default)]
    pub target_url: Option<String>,
    /// Per-request deadline in milliseconds (defaults to 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: None,
            timeout_ms: default_timeout_ms(),
            log: LogConfig::default(),
        }
    }
}

/// Validated settings consumed by the proxy core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// The target exactly as configured; requests go here and tokens are
    /// minted for it, so no normalisation is applied.
    pub audience: String,
    pub timeout: Duration,
}

/// Reasons a configuration cannot be used.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error(transparent)]
    Figment(#[from] figment::Error),

    #[error("target_url is required (use --url or IDGATE_TARGET_URL)")]
    MissingTargetUrl,

    #[error("target_url {url:?} is not a valid absolute URL: {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("target_url {0:?} must use https")]
    InsecureTargetUrl(String),

    #[error("timeout_ms must be between 1 and {MAX_TIMEOUT_MS}, got {0}")]
    InvalidTimeout(u64),
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads defaults, then the optional file, then `IDGATE_*` variables.
    ///
    /// Nested keys use a double underscore, e.g. `IDGATE_LOG__LEVEL=debug`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] if `path` names no file, or
    /// [`ConfigError::Figment`] if a source cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Per-request deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the target URL and timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the URL is missing, malformed or not
    /// `https`, or the timeout is out of bounds.
    #[allow(clippy::result_large_err)]
    pub fn upstream(&self) -> Result<UpstreamSettings, ConfigError> {
        let raw = self
            .target_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingTargetUrl)?;

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidTargetUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidTargetUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if url.scheme() != "https" {
            return Err(ConfigError::InsecureTargetUrl(raw.to_string()));
        }

        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidTimeout(self.timeout_ms));
        }

        Ok(UpstreamSettings {
            audience: raw.to_string(),
            timeout: self.timeout(),
        })
    }
}
