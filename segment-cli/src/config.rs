//! Configuration loading and parsing

use anyhow::{Context, Result};
use segment_import::ImportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub definitions: DefinitionsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("segments.db")
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Worker threads for multi-segment imports (default: one per core)
    pub jobs: Option<usize>,
    /// Abort imports still running after this many seconds
    pub deadline_secs: Option<u64>,
}

impl ExecutionConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DefinitionsConfig {
    #[serde(default)]
    pub dbc_files: Vec<PathBuf>,
    #[serde(default)]
    pub structured_files: Vec<PathBuf>,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if config.execution.jobs == Some(0) {
        anyhow::bail!("execution.jobs must be at least 1 in {:?}", path);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [database]
            path = "/var/lib/segments.db"

            [import]
            materialize_can_signals = false
            message_types = ["carState", "gpsLocation"]
            progress_interval = 500

            [execution]
            jobs = 4
            deadline_secs = 600

            [definitions]
            dbc_files = ["car.dbc", "radar.dbc"]
            structured_files = ["signals.json"]
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/segments.db"));
        assert!(!config.import.materialize_can_signals);
        assert!(config.import.should_process_message_type("gpsLocation"));
        assert!(!config.import.should_process_message_type("controlsState"));
        assert_eq!(config.import.progress_interval, 500);
        assert_eq!(config.import.gps_search_window_secs, 60);
        assert_eq!(config.execution.jobs, Some(4));
        assert_eq!(config.execution.deadline(), Some(Duration::from_secs(600)));
        assert_eq!(config.definitions.dbc_files.len(), 2);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.database.path, PathBuf::from("segments.db"));
        assert!(config.import.materialize_can_signals);
        assert!(config.import.auto_create_definitions);
        assert!(config.execution.jobs.is_none());
        assert!(config.definitions.dbc_files.is_empty());
    }

    #[test]
    fn test_load_config_rejects_zero_jobs() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[execution]\njobs = 0\n").unwrap();
        file.flush().unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
