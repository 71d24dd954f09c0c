//! Tracer configuration.
//!
//! Loading is left to the embedding process; this module only defines the
//! settings the core consumes, their defaults and validation.

use serde::{Deserialize, Serialize};

use crate::reporter::{DEFAULT_HOST, DEFAULT_PORT, join_address};
use crate::sampler::{MAX_SAMPLE_RATE, TraceMode};

/// Settings consumed by the tracing core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Sampling rate out of `MAX_SAMPLE_RATE`.
    pub sample_rate: u32,
    /// Which traces are sampled.
    pub trace_mode: TraceMode,
    /// Where events are sent.
    pub reporter: ReporterConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 300_000,
            trace_mode: TraceMode::Through,
            reporter: ReporterConfig::default(),
        }
    }
}

/// Collector endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Collector host.
    pub host: String,
    /// Collector UDP port.
    pub port: u16,
    /// Disable to drop every event without opening a socket.
    pub enabled: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            enabled: true,
        }
    }
}

impl ReporterConfig {
    /// The `host:port` address of the collector.
    pub fn address(&self) -> String {
        join_address(&self.host, self.port)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl TracerConfig {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if self.sample_rate > MAX_SAMPLE_RATE {
            errors.push(ConfigValidationError {
                field: "sample_rate".to_string(),
                message: format!(
                    "Sample rate {} exceeds maximum {MAX_SAMPLE_RATE}.",
                    self.sample_rate
                ),
            });
        }

        if self.reporter.enabled && self.reporter.host.trim().is_empty() {
            errors.push(ConfigValidationError {
                field: "reporter.host".to_string(),
                message: "Collector host cannot be empty.".to_string(),
            });
        }

        if self.reporter.enabled && self.reporter.port == 0 {
            errors.push(ConfigValidationError {
                field: "reporter.port".to_string(),
                message: "Collector port cannot be 0.".to_string(),
            });
        }

        errors
    }
}
