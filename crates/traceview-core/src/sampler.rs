//! Sampling decisions.
//!
//! A decision is made once, at the root of a trace, and inherited by every
//! descendant event through the identifier's sampled flag.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// Denominator for `sample_rate`: a rate of `MAX_SAMPLE_RATE` samples everything.
pub const MAX_SAMPLE_RATE: u32 = 1_000_000;

/// Governs which traces are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    /// Nothing is sampled.
    Never,
    /// Everything is sampled, regardless of rate.
    Always,
    /// Only traces continuing from a sampled inbound header.
    Through,
    /// New traces are started at the configured rate; inbound headers are honored.
    Rate,
}

impl TraceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceMode::Never => "never",
            TraceMode::Always => "always",
            TraceMode::Through => "through",
            TraceMode::Rate => "rate",
        }
    }
}

impl fmt::Display for TraceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceMode {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(TraceMode::Never),
            "always" => Ok(TraceMode::Always),
            "through" => Ok(TraceMode::Through),
            "rate" => Ok(TraceMode::Rate),
            other => Err(TraceError::Config(format!(
                "Invalid trace mode '{other}'. Expected never, always, through or rate."
            ))),
        }
    }
}

/// Where a sample decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    /// Forced by the trace mode.
    Mode,
    /// Drawn against the configured rate.
    Rate,
    /// Inherited from an inbound continuation header.
    Continued,
}

/// Whether a trace is sampled, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleDecision {
    pub sampled: bool,
    pub source: SampleSource,
}

impl SampleDecision {
    pub fn new(sampled: bool, source: SampleSource) -> Self {
        Self { sampled, source }
    }
}

/// State of the inbound continuation for a new trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// No continuation header.
    None,
    /// A header was present but failed to decode.
    Malformed,
    /// A valid header with the given sampled flag.
    Continued { sampled: bool },
}

impl Inbound {
    fn as_continuation(&self) -> Option<bool> {
        match self {
            Inbound::Continued { sampled } => Some(*sampled),
            Inbound::None | Inbound::Malformed => None,
        }
    }
}

/// Decide whether a trace is sampled.
///
/// A malformed inbound header counts as no continuation at all.
pub fn should_sample(mode: TraceMode, rate: u32, inbound: Inbound) -> SampleDecision {
    match (mode, inbound.as_continuation()) {
        (TraceMode::Never, _) => SampleDecision::new(false, SampleSource::Mode),
        (TraceMode::Always, _) => SampleDecision::new(true, SampleSource::Mode),
        (TraceMode::Through, None) => SampleDecision::new(false, SampleSource::Mode),
        (TraceMode::Through | TraceMode::Rate, Some(sampled)) => {
            SampleDecision::new(sampled, SampleSource::Continued)
        }
        (TraceMode::Rate, None) => SampleDecision::new(draw(rate), SampleSource::Rate),
    }
}

fn draw(rate: u32) -> bool {
    match rate {
        0 => false,
        r if r >= MAX_SAMPLE_RATE => true,
        r => rand::rng().random_range(0..MAX_SAMPLE_RATE) < r,
    }
}

/// A configured sampler shared by every trace in the process.
#[derive(Debug)]
pub struct Sampler {
    mode: TraceMode,
    rate: u32,
    decisions: AtomicU64,
}

impl Sampler {
    /// Create a sampler. Rates above `MAX_SAMPLE_RATE` are clamped.
    pub fn new(mode: TraceMode, rate: u32) -> Self {
        Self {
            mode,
            rate: rate.min(MAX_SAMPLE_RATE),
            decisions: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Make the decision for a new trace root.
    pub fn should_sample(&self, inbound: Inbound) -> SampleDecision {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        should_sample(self.mode, self.rate, inbound)
    }

    /// Number of decisions made so far.
    pub fn decisions_made(&self) -> u64 {
        self.decisions.load(Ordering::Relaxed)
    }
}
