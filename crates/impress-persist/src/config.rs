//! Configuration for impress-persist
//!
//! Settings for the typed layer and the memory backend, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Treat every update and delete as strict: matching zero rows is `NotFound`
    pub strict_mutations: bool,
    /// Memory backend settings
    pub memory: MemoryConfig,
}

/// Memory backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Name reported by the adapter and attached to its log lines
    pub label: String,
    /// Trace every delivered change
    pub log_changes: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            label: "memory".to_string(),
            log_changes: false,
        }
    }
}

impl PersistConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.label.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "memory.label must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PersistConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.strict_mutations);
        assert_eq!(config.memory.label, "memory");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PersistConfig::from_toml("strict_mutations = true\n").unwrap();
        assert!(config.strict_mutations);
        assert_eq!(config.memory, MemoryConfig::default());

        let config = PersistConfig::from_toml("[memory]\nlog_changes = true\n").unwrap();
        assert!(config.memory.log_changes);
        assert_eq!(config.memory.label, "memory");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = PersistConfig::default();
        config.memory.label = "sdk-cache".into();
        let text = config.to_toml().unwrap();
        assert_eq!(PersistConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_label() {
        let err = PersistConfig::from_toml("[memory]\nlabel = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "strict_mutations = true").unwrap();
        let config = PersistConfig::load(file.path()).unwrap();
        assert!(config.strict_mutations);

        let err = PersistConfig::load(Path::new("/nonexistent/persist.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
