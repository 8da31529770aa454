//! TOML configuration for the collector.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

fn default_update_interval() -> u64 {
    3600
}

fn default_update_jitter() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// Where statistics and baseline state live. Relative paths are
    /// resolved against the config file's directory.
    pub data_dir: Option<PathBuf>,
    /// Seconds between polls.
    pub update_interval: u64,
    /// Random startup jitter applied to the interval, in seconds.
    pub update_jitter: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            data_dir: None,
            update_interval: default_update_interval(),
            update_jitter: default_update_jitter(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the config, or fall back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory, defaulting to `<config dir>/data`.
    pub fn resolve_data_dir(&self, config_path: &Path) -> PathBuf {
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.join("data"),
        }
    }
}

/// A config file in the working directory wins; otherwise the usual
/// per-user config location.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("ocea-collector.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocea-collector")
        .join("config.toml")
}
