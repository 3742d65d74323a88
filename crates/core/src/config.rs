// Store location and lifecycle tuning.
//
// Global config: `~/.redmap/config.toml`
// Environment overrides: `REDMAP_*` (see `MapConfig::with_env_fn`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CLEANUP_GRACE_MS: u64 = 50;
const DEFAULT_MAX_CLEANUP_ATTEMPTS: u32 = 8;

/// Root directory for redmap state: `~/.redmap/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".redmap"))
}

/// Path to the global config file: `~/.redmap/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Connection and cleanup settings for a [`crate::Lifecycle`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MapConfig {
    /// Store host name.
    pub host: String,
    /// Store port.
    pub port: u16,
    /// Logical database index. Only the collections live in it: pub/sub
    /// channels are server-wide, so handles on the same name in different
    /// databases count toward each other's liveness.
    pub db: i64,
    /// Optional store password.
    pub password: Option<String>,
    /// How often the detector drains the delivery queue.
    pub poll_interval_ms: u64,
    /// Upper bound for every individual remote command.
    pub command_timeout_ms: u64,
    /// Pause between the two subscriber counts taken before a delete.
    pub cleanup_grace_ms: u64,
    /// Cleanup attempts per handle before the entry is abandoned.
    pub max_cleanup_attempts: u32,
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db: 0,
            password: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            cleanup_grace_ms: DEFAULT_CLEANUP_GRACE_MS,
            max_cleanup_attempts: DEFAULT_MAX_CLEANUP_ATTEMPTS,
            log_filter: "info".to_string(),
        }
    }
}

impl MapConfig {
    /// Defaults, then `~/.redmap/config.toml` if it parses, then `REDMAP_*`.
    pub fn load() -> Self {
        let base = global_config_path()
            .filter(|path| path.exists())
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default();
        base.with_env()
    }

    /// Load from a specific TOML file. Missing keys keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply `REDMAP_*` environment overrides.
    pub fn with_env(self) -> Self {
        self.with_env_fn(|key| std::env::var(key))
    }

    /// Testable variant that accepts an environment lookup function.
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `REDMAP_URL` | host, port, password and db from `redis://` url |
    /// | `REDMAP_HOST` | host |
    /// | `REDMAP_PORT` | port |
    /// | `REDMAP_DB` | db |
    /// | `REDMAP_POLL_INTERVAL_MS` | poll interval |
    /// | `REDMAP_COMMAND_TIMEOUT_MS` | command timeout |
    /// | `REDMAP_CLEANUP_GRACE_MS` | cleanup grace |
    /// | `REDMAP_MAX_CLEANUP_ATTEMPTS` | max cleanup attempts |
    /// | `REDMAP_LOG_FILTER` | log filter |
    ///
    /// Values that fail to parse leave the current setting untouched.
    pub fn with_env_fn<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(url) = env("REDMAP_URL") {
            if let Err(error) = self.apply_url(&url) {
                tracing::warn!(%error, "ignoring REDMAP_URL");
            }
        }
        if let Ok(host) = env("REDMAP_HOST") {
            self.host = host;
        }
        override_parsed(&env, "REDMAP_PORT", &mut self.port);
        override_parsed(&env, "REDMAP_DB", &mut self.db);
        override_parsed(&env, "REDMAP_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed(&env, "REDMAP_COMMAND_TIMEOUT_MS", &mut self.command_timeout_ms);
        override_parsed(&env, "REDMAP_CLEANUP_GRACE_MS", &mut self.cleanup_grace_ms);
        override_parsed(&env, "REDMAP_MAX_CLEANUP_ATTEMPTS", &mut self.max_cleanup_attempts);
        if let Ok(filter) = env("REDMAP_LOG_FILTER") {
            self.log_filter = filter;
        }
        self
    }

    /// Take host, port, password and database index from a `redis://` url.
    pub fn apply_url(&mut self, raw: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(raw).map_err(|error| invalid(&error.to_string()))?;
        if url.scheme() != "redis" {
            return Err(invalid("scheme must be redis://"));
        }
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| invalid("missing host"))?;

        let db = match url.path().trim_start_matches('/') {
            "" => 0,
            segment => segment.parse().map_err(|_| invalid("database must be an integer"))?,
        };

        self.host = host.to_string();
        self.port = url.port().unwrap_or(DEFAULT_PORT);
        self.db = db;
        self.password = url.password().map(str::to_string);
        Ok(())
    }

    /// Connection url handed to the redis client.
    pub fn redis_url(&self) -> String {
        let plain = format!("redis://{}:{}/{}", self.host, self.port, self.db);
        let Some(password) = &self.password else {
            return plain;
        };
        let Ok(mut url) = Url::parse(&plain) else {
            return plain;
        };
        if url.set_password(Some(password)).is_ok() {
            url.to_string()
        } else {
            plain
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

fn override_parsed<F, T>(env: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    if let Some(value) = env(key).ok().and_then(|v| v.trim().parse().ok()) {
        *slot = value;
    }
}
