//! File + environment loader.
//!
//! Sources, lowest priority first:
//! 1. `tiercache.toml` in the working directory (or an explicit path)
//! 2. `TIERCACHE__SECTION__KEY` environment variables,
//!    e.g. `TIERCACHE__REDIS__ENABLED=true`

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};

use crate::{ConfigError, TierCacheConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tiercache.toml";
pub const ENV_PREFIX: &str = "TIERCACHE";

/// Loads configuration from `path` (or the default file) plus the environment.
///
/// A missing file is not an error; defaults apply.
pub fn load_config(path: Option<&str>) -> Result<TierCacheConfig, ConfigError> {
    let path = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
    build(&path, Environment::with_prefix(ENV_PREFIX))
}

pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<TierCacheConfig, ConfigError> {
    build(path.as_ref(), Environment::with_prefix(ENV_PREFIX))
}

fn build(path: &Path, environment: Environment) -> Result<TierCacheConfig, ConfigError> {
    let mut builder = Config::builder();
    if path.exists() {
        tracing::debug!(path = %path.display(), "loading cache configuration file");
        builder = builder.add_source(File::from(path.to_path_buf()));
    }
    builder = builder.add_source(environment.try_parsing(true).separator("__"));

    let merged: TierCacheConfig = builder.build()?.try_deserialize()?;
    merged.validate()?;
    Ok(merged)
}

#[cfg(test)]
pub(crate) fn load_with_env(
    path: &Path,
    vars: &[(&str, &str)],
) -> Result<TierCacheConfig, ConfigError> {
    let source = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    build(path, Environment::with_prefix(ENV_PREFIX).source(Some(source)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_with_env(&dir.path().join("absent.toml"), &[]).unwrap();
        assert_eq!(config, TierCacheConfig::default());
    }

    #[test]
    fn test_file_values_are_read() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "prefix = \"svc\"\n[defaults]\nttl_ms = 1234\n[redis]\nurl = \"redis://cache:6379\""
        )
        .unwrap();

        let config = load_with_env(file.path(), &[]).unwrap();
        assert_eq!(config.prefix, "svc");
        assert_eq!(config.defaults.ttl_ms, 1234);
        assert_eq!(config.redis.url, "redis://cache:6379");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[redis]\nenabled = false\npool_size = 4").unwrap();

        let config = load_with_env(
            file.path(),
            &[
                ("TIERCACHE__REDIS__ENABLED", "true"),
                ("TIERCACHE__REDIS__POOL_SIZE", "16"),
            ],
        )
        .unwrap();
        assert!(config.redis.enabled);
        assert_eq!(config.redis.pool_size, 16);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[defaults]\nttl_ms = 0").unwrap();
        let err = load_with_env(file.path(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
