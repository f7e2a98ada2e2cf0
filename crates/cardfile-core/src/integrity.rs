//! Cross-store record count comparison.
//!
//! The sweep is pure: callers hand in whatever counts they could observe
//! and get back a report. Sources that could not be read at all are simply
//! not handed in; an unreadable mirror is indistinguishable from a missing
//! one, and neither fails the sweep.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where a count was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    /// The live in-memory dataset.
    Memory,
    /// The primary mirror in the bounded store.
    Primary,
    /// The backup mirror in the bounded store.
    Backup,
    /// The newest summary row in the structured store.
    AsyncStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedCount {
    pub source: CountSource,
    pub count: usize,
}

impl ObservedCount {
    #[must_use]
    pub fn new(source: CountSource, count: usize) -> Self {
        Self { source, count }
    }
}

/// Tolerance knobs for the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Fraction of the largest count the spread may reach.
    #[serde(default = "default_gap_fraction")]
    pub gap_fraction: f64,
    /// Absolute spread always tolerated, so tiny datasets do not flag on
    /// a single missing record.
    #[serde(default = "default_gap_floor")]
    pub gap_floor: usize,
}

fn default_gap_fraction() -> f64 {
    0.10
}

fn default_gap_floor() -> usize {
    5
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            gap_fraction: default_gap_fraction(),
            gap_floor: default_gap_floor(),
        }
    }
}

impl IntegrityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gap_fraction.is_finite() || !(0.0..=1.0).contains(&self.gap_fraction) {
            return Err(ConfigError::Invalid(format!(
                "integrity.gap_fraction must be within 0.0..=1.0, got {}",
                self.gap_fraction
            )));
        }
        Ok(())
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub observed: Vec<ObservedCount>,
    pub max_count: usize,
    pub min_count: usize,
    /// Effective tolerance: `max(gap_fraction * max_count, gap_floor)`.
    pub allowed_gap: f64,
    pub flagged: bool,
    pub checked_at_ms: i64,
}

impl IntegrityReport {
    #[must_use]
    pub fn spread(&self) -> usize {
        self.max_count - self.min_count
    }
}

/// Compare observed counts against the tolerance.
///
/// Flags when the spread strictly exceeds the allowed gap. Fewer than two
/// observations can never disagree with anything, so they never flag.
#[must_use]
pub fn evaluate(
    observed: Vec<ObservedCount>,
    config: &IntegrityConfig,
    now_ms: i64,
) -> IntegrityReport {
    let max_count = observed.iter().map(|o| o.count).max().unwrap_or(0);
    let min_count = observed.iter().map(|o| o.count).min().unwrap_or(0);
    let allowed_gap = (config.gap_fraction * max_count as f64).max(config.gap_floor as f64);
    let spread = (max_count - min_count) as f64;
    let flagged = observed.len() >= 2 && spread > allowed_gap;
    IntegrityReport {
        observed,
        max_count,
        min_count,
        allowed_gap,
        flagged,
        checked_at_ms: now_ms,
    }
}
