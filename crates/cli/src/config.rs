//! Configuration management for the deckflow CLI
//!
//! Handles loading and saving configuration from ~/.deckflow/config.toml

use std::path::{Path, PathBuf};

use anyhow::Result;
use deckflow::WorkflowConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the deckflow CLI
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where rendered decks are written
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,

    /// SQLite file holding run checkpoints
    #[serde(default = "default_checkpoint_db")]
    pub checkpoint_db: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("decks")
}

fn default_checkpoint_db() -> PathBuf {
    Config::config_dir().join("checkpoints.db")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            checkpoint_db: default_checkpoint_db(),
        }
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deckflow")
    }

    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default file, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
