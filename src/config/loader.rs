use crate::config::schema::{EngineConfig, SchemaError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File the CLI looks for in the working directory when no config is given.
pub const DEFAULT_CONFIG_FILE: &str = ".defect-patcher.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read engine config from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse engine config TOML{}: {source}", describe(.path))]
    Toml {
        path: Option<PathBuf>,
        #[source]
        source: toml_edit::de::Error,
    },
    #[error("invalid engine config{}: {source}", describe(.path))]
    Invalid {
        path: Option<PathBuf>,
        #[source]
        source: SchemaError,
    },
}

fn describe(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| format!(" ({})", path.display()))
        .unwrap_or_default()
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = Some(path.to_path_buf());
        match self {
            ConfigError::Toml { path: None, source } => ConfigError::Toml { path, source },
            ConfigError::Invalid { path: None, source } => ConfigError::Invalid { path, source },
            other => other,
        }
    }
}

pub fn load_from_str(input: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    config
        .validate()
        .map_err(|source| ConfigError::Invalid { path: None, source })?;
    Ok(config)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Load `path` if given, else `<working_dir>/.defect-patcher.toml` if present,
/// else the defaults.
pub fn discover(path: Option<&Path>, working_dir: &Path) -> Result<EngineConfig, ConfigError> {
    if let Some(path) = path {
        return load_from_path(path);
    }
    let candidate = working_dir.join(DEFAULT_CONFIG_FILE);
    if candidate.is_file() {
        return load_from_path(candidate);
    }
    Ok(EngineConfig::default())
}
