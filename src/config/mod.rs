//! Configuration for the host: backend discovery directory and
//! introspection limits, loaded from a TOML file with defaults for
//! everything.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub interfaces: InterfaceConfig,

    #[serde(default)]
    pub introspection: IntrospectionConfig,
}

/// Backend discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    /// Directory scanned for backend shared libraries
    #[serde(default = "default_interfaces_directory")]
    pub directory: PathBuf,
}

/// Limits applied to the memory introspection algorithms
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntrospectionConfig {
    /// Maximum pointer-chain hops followed by indirection resolution
    #[serde(default = "default_max_indirections")]
    pub max_indirections: usize,

    /// Chunk size for bounded RTTI type-name reads
    #[serde(default = "default_rtti_name_chunk")]
    pub rtti_name_chunk: usize,

    /// Upper bound on a recovered RTTI type-name length
    #[serde(default = "default_rtti_max_name_len")]
    pub rtti_max_name_len: usize,
}

fn default_interfaces_directory() -> PathBuf {
    PathBuf::from("memory_interfaces")
}

fn default_max_indirections() -> usize {
    10
}

fn default_rtti_name_chunk() -> usize {
    256
}

fn default_rtti_max_name_len() -> usize {
    4096
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            directory: default_interfaces_directory(),
        }
    }
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        IntrospectionConfig {
            max_indirections: default_max_indirections(),
            rtti_name_chunk: default_rtti_name_chunk(),
            rtti_max_name_len: default_rtti_max_name_len(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interfaces: InterfaceConfig::default(),
            introspection: IntrospectionConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file; a missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Config> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration back out as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.introspection.max_indirections == 0 {
            return Err(ConfigError::Invalid(
                "introspection.max_indirections must be at least 1".to_string(),
            ));
        }

        if self.introspection.rtti_name_chunk == 0 {
            return Err(ConfigError::Invalid(
                "introspection.rtti_name_chunk must be at least 1".to_string(),
            ));
        }

        if self.introspection.rtti_max_name_len < self.introspection.rtti_name_chunk {
            return Err(ConfigError::Invalid(
                "introspection.rtti_max_name_len must cover at least one chunk".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.introspection.max_indirections, 10);
        assert_eq!(config.introspection.rtti_name_chunk, 256);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("definitely/not/a/real/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[introspection]\nmax_indirections = 4\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.introspection.max_indirections, 4);
        assert_eq!(config.introspection.rtti_name_chunk, 256);
        assert_eq!(
            config.interfaces.directory,
            PathBuf::from("memory_interfaces")
        );
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.introspection.max_indirections = 3;
        config.interfaces.directory = PathBuf::from("plugins");
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let mut config = Config::default();
        config.introspection.max_indirections = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.introspection.rtti_max_name_len = 1;
        assert!(config.validate().is_err());
    }
}
