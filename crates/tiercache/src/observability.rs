//! Tracing setup for processes embedding the cache.
//!
//! The host usually owns its subscriber; these helpers exist for tests,
//! small services and tools that want the `[logging]` section of the cache
//! configuration to drive log output.

use std::sync::OnceLock;

use tiercache_config::LoggingSection;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the global subscriber with `level` as the default directive.
///
/// `RUST_LOG` takes precedence when it parses; an invalid `level` falls
/// back to `info`. Only the first call in a process installs anything.
pub fn init_tracing_with_level(level: &str) {
    let mut rejected = None;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        build_filter(level).unwrap_or_else(|e| {
            rejected = Some(e);
            EnvFilter::new("info")
        })
    });
    let (layer, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    if tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already set, tiercache logging left as is");
    }
    if let Some(e) = rejected {
        tracing::warn!(level, error = %e, "invalid log level, using info");
    }
}

pub fn init_tracing_from_config(logging: &LoggingSection) {
    init_tracing_with_level(&logging.level);
}

/// Replaces the active filter. Returns `false` when tracing was not
/// initialized through this module or `level` does not parse.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    let filter = match build_filter(level) {
        Ok(filter) => filter,
        Err(e) => {
            tracing::warn!(level, error = %e, "invalid log level, keeping current filter");
            return false;
        }
    };
    match handle.reload(filter) {
        Ok(()) => {
            tracing::info!(level, "log level changed");
            true
        }
        Err(e) => {
            tracing::warn!(level, error = %e, "failed to change log level");
            false
        }
    }
}

fn build_filter(level: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(level)
}
