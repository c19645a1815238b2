//! Engine configuration
//!
//! Loaded from a TOML file when one is given; every field has a default so
//! a partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::quota::QuotaPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for the key-value database and large files
    pub data_dir: PathBuf,
    /// How far back merge pre-checks load merge locks
    pub merge_window_secs: u64,
    /// How far back checkouts and browsing load merge locks
    pub checkout_window_secs: u64,
    /// Largest request body the HTTP frontend accepts
    pub max_body_size: usize,
    pub quota: QuotaPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            merge_window_secs: 60 * 60,
            checkout_window_secs: 30 * 60,
            max_body_size: 100 * 1024 * 1024,
            quota: QuotaPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: EngineConfig =
            toml::from_str(&data).with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = toml::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn large_file_path(&self) -> PathBuf {
        self.data_dir.join("large")
    }

    pub fn merge_window_millis(&self) -> i64 {
        (self.merge_window_secs * 1000) as i64
    }

    pub fn checkout_window_millis(&self) -> i64 {
        (self.checkout_window_secs * 1000) as i64
    }
}
