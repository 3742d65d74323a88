// Error types shared by the store contract, the handle API and cleanup.

use std::time::Duration;

/// Boxed source error carried by [`MapError::StoreUnavailable`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = MapError> = std::result::Result<T, E>;

/// Errors surfaced by [`crate::SharedMap`] operations and the store contract.
///
/// CRUD calls return these to the caller unchanged. The cleanup path never
/// returns them: it logs them and falls back to the conservative outcome.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The remote store refused the connection or failed a command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] BoxError),

    /// A single remote command exceeded the configured command timeout.
    #[error("store command `{command}` timed out after {timeout:?}")]
    Timeout { command: &'static str, timeout: Duration },

    /// The liveness subscription could not be established or torn down.
    #[error("subscription on channel `{channel}` failed: {reason}")]
    SubscriptionFailure { channel: String, reason: String },
}

impl MapError {
    pub fn unavailable(source: impl Into<BoxError>) -> Self {
        Self::StoreUnavailable(source.into())
    }

    pub fn subscription(channel: &str, reason: impl std::fmt::Display) -> Self {
        Self::SubscriptionFailure { channel: channel.to_string(), reason: reason.to_string() }
    }

    /// Whether the failure says nothing about the data itself and the call
    /// may succeed if repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for MapError {
    fn from(error: redis::RedisError) -> Self {
        Self::StoreUnavailable(Box::new(error))
    }
}

/// Errors from loading or parsing [`crate::MapConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid store url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}
