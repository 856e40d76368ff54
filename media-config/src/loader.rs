use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::CoreConfig;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse inline config json: {0}")]
    InlineJson(#[source] serde_json::Error),
}

/// Where a loaded [`CoreConfig`] came from, surfaced for diagnostics/logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    File(PathBuf),
}

const DEFAULT_CANDIDATES: &[&str] = &["media-server.toml", "config/media-server.toml"];

/// Loads configuration with the following precedence:
/// 1. `$MEDIA_SERVER_CONFIG_PATH`, if set;
/// 2. the first of [`DEFAULT_CANDIDATES`] that exists relative to the
///    current working directory;
/// 3. [`CoreConfig::default`].
pub fn load() -> Result<(CoreConfig, ConfigSource), ConfigLoadError> {
    if let Ok(path) = env::var("MEDIA_SERVER_CONFIG_PATH") {
        let path = PathBuf::from(path);
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    for candidate in DEFAULT_CANDIDATES {
        let path = Path::new(candidate);
        if path.exists() {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::File(path.to_path_buf())));
        }
    }

    Ok((CoreConfig::default(), ConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> Result<CoreConfig, ConfigLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "[throttle]\ncpu_target_pct = 55.0\n").unwrap();

        let config = load_from_file(&path).unwrap();
        assert_eq!(config.throttle.cpu_target_pct, 55.0);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_from_file(Path::new("/nonexistent/media-server.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Read { .. }));
    }
}
