use crate::constants;
use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sefaz: SefazConfig,
    pub sync: SyncConfig,
    pub lifecycle: LifecycleConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SefazConfig {
    /// Non-production safety valve: substitute a simulated "no documents"
    /// response when the live call fails. Never enable in production.
    pub allow_simulation: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_iterations: u32,
    pub iteration_delay_ms: u64,
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub batch_size: usize,
    pub document_delay_ms: u64,
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub blob_root: String,
}

impl Default for SefazConfig {
    fn default() -> Self {
        Self { allow_simulation: false, timeout_seconds: 60 }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_iterations: constants::MAX_SYNC_ITERATIONS,
            iteration_delay_ms: constants::SYNC_ITERATION_DELAY_MS,
            interval_minutes: 60,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            document_delay_ms: constants::DOCUMENT_DELAY_MS,
            interval_minutes: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { blob_root: "xmls".to_string() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sefaz: SefazConfig::default(),
            sync: SyncConfig::default(),
            lifecycle: LifecycleConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Loads configuration from a TOML file; a missing file yields defaults.
    pub fn load_from(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(EngineError::Config(format!(
                "Failed to read config file '{}': {}",
                path, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from("does-not-exist.toml").unwrap();
        assert!(!config.sefaz.allow_simulation);
        assert_eq!(config.sync.max_iterations, constants::MAX_SYNC_ITERATIONS);
        assert_eq!(config.lifecycle.interval_minutes, 5);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[sefaz]\nallow_simulation = true\n\n[lifecycle]\nbatch_size = 3").unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert!(config.sefaz.allow_simulation);
        assert_eq!(config.lifecycle.batch_size, 3);
        assert_eq!(config.lifecycle.document_delay_ms, constants::DOCUMENT_DELAY_MS);
    }
}
