//! Configuration loading from `~/.von/config.toml` with defaults.
//!
//! Loading happens before the tracing subscriber exists (the file decides
//! where logs go), so the outcome is returned as a [`ConfigSource`] and
//! logged once logging is up.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use von_types::NodeConfig;

/// Where the active configuration came from.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Fallback { path: PathBuf, error: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!(path = %path.display(), "Loaded configuration"),
            ConfigSource::Missing(path) => {
                info!(path = %path.display(), "Config file not found, using defaults")
            }
            ConfigSource::Fallback { path, error } => warn!(
                error = %error,
                path = %path.display(),
                "Failed to load config, using defaults"
            ),
        }
    }
}

/// Load node configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> (NodeConfig, ConfigSource) {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return (NodeConfig::default(), ConfigSource::Missing(config_path));
    }

    let loaded = std::fs::read_to_string(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|contents| toml::from_str::<NodeConfig>(&contents).map_err(|e| e.to_string()));
    match loaded {
        Ok(config) => (config, ConfigSource::File(config_path)),
        Err(error) => (
            NodeConfig::default(),
            ConfigSource::Fallback {
                path: config_path,
                error,
            },
        ),
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    von_home().join("config.toml")
}

/// Get the default VON home directory.
pub fn von_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".von")
}
