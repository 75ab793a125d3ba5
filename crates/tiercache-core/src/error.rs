//! Error types for cache operations.
//!
//! Tier and transport failures have their own error enums so that driver
//! implementations do not need to know about the orchestrator. Both convert
//! into [`CacheError`], which is what the public API returns.

use std::fmt;
use std::time::Duration;

/// Boxed error produced by a caller-supplied factory.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used across the workspace.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors returned by a backing store (the driver contract).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The store could not be reached.
    #[error("Driver connection error: {message}")]
    Connection { message: String },

    /// The store rejected or failed a command.
    #[error("Driver command error: {message}")]
    Command { message: String },

    /// The driver was already disconnected.
    #[error("Driver is disconnected")]
    Disconnected,
}

impl DriverError {
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }
}

/// Errors returned by a bus transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport connection error: {message}")]
    Connection { message: String },

    #[error("Transport publish error: {message}")]
    Publish { message: String },

    #[error("Transport subscribe error: {message}")]
    Subscribe { message: String },

    #[error("Transport message error: {message}")]
    Message { message: String },

    #[error("Transport is disconnected")]
    Disconnected,
}

impl TransportError {
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Public error type of the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A wire envelope could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// A value could not be converted to or from its cached representation.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The per-key computation lock could not be acquired in time.
    #[error("Timed out after {timeout:?} waiting for the lock on key '{key}'")]
    LockTimeout { key: String, timeout: Duration },

    /// The caller-supplied factory failed and no stale value could be served.
    #[error("Factory failed for key '{key}': {source}")]
    Factory {
        key: String,
        #[source]
        source: BoxError,
    },

    /// A remote tier operation exceeded its deadline.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The cache was disconnected.
    #[error("Cache has been disconnected")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn lock_timeout(key: impl Into<String>, timeout: Duration) -> Self {
        Self::LockTimeout {
            key: key.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn factory(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Factory {
            key: key.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns `true` for failures of the remote tier or the bus, which the
    /// orchestrator may degrade instead of propagating.
    #[must_use]
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::Driver(_) | Self::Transport(_) | Self::Timeout { .. }
        )
    }

    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory { .. })
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Decode { .. } | Self::Serialization(_) => ErrorCategory::Decode,
            Self::Driver(_) | Self::Transport(_) => ErrorCategory::Infrastructure,
            Self::LockTimeout { .. } | Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Factory { .. } => ErrorCategory::Factory,
            Self::Disconnected => ErrorCategory::Lifecycle,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Categories of cache errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Decode,
    Infrastructure,
    Timeout,
    Factory,
    Lifecycle,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => write!(f, "decode"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Factory => write!(f, "factory"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::lock_timeout("users:1", Duration::from_millis(50));
        assert_eq!(
            err.to_string(),
            "Timed out after 50ms waiting for the lock on key 'users:1'"
        );

        let err: CacheError = DriverError::connection("refused").into();
        assert_eq!(err.to_string(), "Driver connection error: refused");
    }

    #[test]
    fn test_factory_error_keeps_source() {
        let err = CacheError::factory("k", "upstream down");
        assert!(err.is_factory());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("upstream down"));
    }

    #[test]
    fn test_remote_failure_classification() {
        assert!(CacheError::from(DriverError::command("boom")).is_remote_failure());
        assert!(CacheError::from(TransportError::publish("boom")).is_remote_failure());
        assert!(CacheError::timeout("remote.get", Duration::from_millis(5)).is_remote_failure());
        assert!(!CacheError::decode("bad").is_remote_failure());
        assert!(!CacheError::Disconnected.is_remote_failure());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(CacheError::decode("x").category(), ErrorCategory::Decode);
        assert_eq!(
            CacheError::lock_timeout("k", Duration::ZERO).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(CacheError::Disconnected.category().to_string(), "lifecycle");
    }
}
