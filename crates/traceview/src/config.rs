//! Configuration file support for TraceView.
//!
//! Agent settings live in a `.traceview/` directory:
//! - `.traceview/config.toml` - Configuration file
//! - `.traceview/logs/` - Collector log files
//!
//! Config discovery searches for `.traceview/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The traceview data directory name.
pub const TRACEVIEW_DIR: &str = ".traceview";
/// The config file name within the traceview directory.
pub const CONFIG_FILE: &str = "config.toml";

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use traceview_core::{TraceMode, TracerConfig};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Tracer settings consumed by the tracing core.
    pub tracer: TracerConfig,
    /// Collector simulator settings.
    pub listen: ListenConfig,
}

/// Collector simulator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: traceview_core::reporter::DEFAULT_PORT,
        }
    }
}

/// Command-line overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub sample_rate: Option<u32>,
    pub trace_mode: Option<TraceMode>,
    pub collector: Option<String>,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.traceview/config.toml` in the directory and its parents.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let traceview_dir = dir.join(TRACEVIEW_DIR);
            let config_path = traceview_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                // Return the .traceview directory, not the config file
                return Ok(Some((config, traceview_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Load configuration from an explicit directory, by discovery, or use defaults.
    pub fn load(explicit_dir: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(dir) = explicit_dir {
            let config = Self::from_file(&dir.join(CONFIG_FILE))?;
            return Ok((config, Some(dir.to_path_buf())));
        }

        match Self::find_and_load() {
            Ok(Some((config, path))) => {
                tracing::info!("Loaded config from {}", path.display());
                Ok((config, Some(path)))
            }
            Ok(None) => {
                tracing::debug!("No .traceview/config.toml found, using defaults");
                Ok((Self::default(), None))
            }
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Ok((Self::default(), None))
            }
        }
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(rate) = overrides.sample_rate {
            self.tracer.sample_rate = rate;
        }
        if let Some(mode) = overrides.trace_mode {
            self.tracer.trace_mode = mode;
        }
        if let Some(collector) = &overrides.collector {
            let (host, port) = traceview_core::reporter::split_address(collector);
            self.tracer.reporter.host = host;
            self.tracer.reporter.port = port;
        }
    }

    /// Get the config file path for a given .traceview directory.
    pub fn config_path(traceview_dir: &Path) -> PathBuf {
        traceview_dir.join(CONFIG_FILE)
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}
