//! Configuration loading and data folder resolution
//!
//! The data folder holds the embedding cache and persisted indexes.
//! Resolution follows a fixed priority order:
//! 1. Explicit caller argument (highest priority)
//! 2. Environment variable `TRACKMATCH_DATA`
//! 3. TOML config file (`data_folder` key)
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable consulted for data folder resolution
pub const DATA_ENV_VAR: &str = "TRACKMATCH_DATA";

/// Logging verbosity from TOML config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Logging section of the TOML config
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// Top-level TOML configuration file contents
///
/// Unknown keys are rejected at load time rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Data folder override (cache + indexes live under this folder)
    pub data_folder: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Load and parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }
}

/// Resolve the data folder following the documented priority order
pub fn resolve_data_folder(explicit: Option<&str>) -> PathBuf {
    // Priority 1: explicit caller argument
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(DATA_ENV_VAR) {
        if !path.trim().is_empty() {
            tracing::debug!(path = %path, "Data folder from {}", DATA_ENV_VAR);
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = default_config_file() {
        if let Ok(config) = TomlConfig::load(&config_path) {
            if let Some(folder) = config.data_folder {
                tracing::debug!(path = %folder, "Data folder from TOML config");
                return PathBuf::from(folder);
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    default_data_folder()
}

/// Default configuration file path for the platform
fn default_config_file() -> Result<PathBuf> {
    let path = dirs::config_dir()
        .map(|d| d.join("trackmatch").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if path.exists() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {:?}", path)))
    }
}

/// OS-dependent default data folder path
fn default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("trackmatch"))
        .unwrap_or_else(|| PathBuf::from("./trackmatch_data"))
}

/// Ensure a directory exists, creating it (and parents) if missing
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_argument_wins() {
        let resolved = resolve_data_folder(Some("/tmp/trackmatch-test"));
        assert_eq!(resolved, PathBuf::from("/tmp/trackmatch-test"));
    }

    #[test]
    #[serial_test::serial]
    fn test_env_var_resolution() {
        std::env::set_var(DATA_ENV_VAR, "/tmp/trackmatch-env");
        let resolved = resolve_data_folder(None);
        std::env::remove_var(DATA_ENV_VAR);
        assert_eq!(resolved, PathBuf::from("/tmp/trackmatch-env"));
    }

    #[test]
    #[serial_test::serial]
    fn test_blank_env_var_ignored() {
        std::env::set_var(DATA_ENV_VAR, "   ");
        let resolved = resolve_data_folder(None);
        std::env::remove_var(DATA_ENV_VAR);
        assert_ne!(resolved, PathBuf::from("   "));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            data_folder = "/var/lib/trackmatch"

            [logging]
            level = "debug"
        "#;
        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_folder.as_deref(), Some("/var/lib/trackmatch"));
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml_str = r#"
            data_folder = "/var/lib/trackmatch"
            surprise_option = true
        "#;
        let result: std::result::Result<TomlConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err(), "unknown keys must be rejected");
    }

    #[test]
    fn test_ensure_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
