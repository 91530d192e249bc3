//! Device identity
//!
//! Each data directory belongs to one device. The device id is a random
//! UUID created on first use and kept in `<data_dir>/device_id`; vector
//! clocks and payload origins use it to tell devices apart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::Config;

/// Device identity manager for one data directory
#[derive(Debug, Clone)]
pub struct Identity {
    path: PathBuf,
}

impl Identity {
    /// Identity for the configured data directory
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        Ok(Self::with_config(&config))
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            path: config.device_id_path(),
        }
    }

    /// Identity stored at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a device id has been stored yet
    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    /// The stored device id, if any
    pub fn device_id(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read device id: {:?}", self.path))?;
        let id = content.trim();
        if id.is_empty() {
            anyhow::bail!("Device id file is empty: {:?}", self.path);
        }
        Ok(Some(id.to_string()))
    }

    /// The stored device id, creating one on first use
    pub fn load_or_create(&self) -> Result<String> {
        if let Some(id) = self.device_id()? {
            return Ok(id);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {:?}", parent))?;
        }

        let id = Uuid::new_v4().to_string();
        std::fs::write(&self.path, &id)
            .with_context(|| format!("Failed to write device id: {:?}", self.path))?;
        tracing::info!(device_id = %id, "Created device identity");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_not_initialized_initially() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(&test_config(&temp_dir));

        assert!(!identity.is_initialized());
        assert!(identity.device_id().unwrap().is_none());
    }

    #[test]
    fn test_load_or_create_persists() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let first = Identity::with_config(&config).load_or_create().unwrap();
        assert!(Uuid::parse_str(&first).is_ok());

        // Simulates a restart
        let second = Identity::with_config(&config).load_or_create().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_separate_data_dirs_get_separate_ids() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        let id_a = Identity::with_config(&test_config(&a)).load_or_create().unwrap();
        let id_b = Identity::with_config(&test_config(&b)).load_or_create().unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_empty_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::at(temp_dir.path().join("device_id"));
        std::fs::write(identity.path(), "  \n").unwrap();

        let err = identity.load_or_create().unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
