//! On-disk configuration for Minerva (`~/.minerva/config.toml`).

use std::io;
use std::path::{Path, PathBuf};

use minerva_swank::SwankConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MinervaConfig {
    pub app: AppConfig,
    pub swank: SwankConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Start a SWANK session at launch. When false the host stays idle.
    pub start_repl: bool,
    /// Lisp executable. Absent means the SWANK server is started externally.
    pub lisp_binary: Option<PathBuf>,
    /// Directory holding the bootstrap script; the working directory if unset.
    pub root_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            start_repl: true,
            lisp_binary: None,
            root_dir: None,
        }
    }
}

impl MinervaConfig {
    /// Load `~/.minerva/config.toml`, falling back to defaults.
    ///
    /// A missing file is silent; an unreadable or malformed one is logged.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("{err}; using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// `~/.minerva`, home of the config file and logs.
pub fn minerva_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".minerva"))
}

fn config_path() -> Option<PathBuf> {
    minerva_dir().map(|dir| dir.join("config.toml"))
}
