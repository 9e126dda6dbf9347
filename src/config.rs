//! Application configuration
//!
//! A single TOML file holds the driver timings and the log level. A missing
//! file is not an error: every section falls back to its defaults so the
//! driver starts with the tuned values.
//!
//! ```toml
//! [driver]
//! settle_delay_ms = 1000
//! read_timeout_ms = 3000
//! hard_error_threshold_ms = 1000
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

use crate::controller::DriverSettings;

const CONFIG_DIR: &str = "backbone-button";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub driver: DriverSettings,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level> {
        Level::from_str(&self.level).map_err(|_| eyre!("Unknown log level: {}", self.level))
    }
}

impl AppConfig {
    /// `<config dir>/backbone-button/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))?;
        config.validate()?;

        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.logging.level()?;
        Ok(())
    }
}
