//! Candidate scoring and selection for dataset recovery.
//!
//! Selection is a pure function over whatever candidates the caller could
//! actually read. A location that failed to load is simply not a
//! candidate. Scores combine record count, freshness of the embedded
//! capture timestamp, and a per-source reliability bonus; ties fall back
//! to the fixed reliability order so the outcome is deterministic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RecoveryError};
use crate::snapshot::Snapshot;

/// Storage locations recovery can draw from, most trusted first.
///
/// The declaration order doubles as the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Primary,
    Backup,
    AsyncStore,
    Snapshot,
}

impl SourceTier {
    #[must_use]
    pub fn bonus(self, weights: &ScoringWeights) -> f64 {
        match self {
            Self::Primary => weights.primary_bonus,
            Self::Backup => weights.backup_bonus,
            Self::AsyncStore => weights.async_store_bonus,
            Self::Snapshot => weights.snapshot_bonus,
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
            Self::AsyncStore => "async_store",
            Self::Snapshot => "snapshot",
        };
        f.write_str(label)
    }
}

/// Tunable scoring weights.
///
/// The defaults weight record count heaviest, then freshness inside a
/// 100 hour horizon, then where the data came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Points per record in the candidate.
    #[serde(default = "default_count_weight")]
    pub count_weight: f64,
    /// Hours over which the recency contribution decays to zero.
    #[serde(default = "default_recency_horizon_hours")]
    pub recency_horizon_hours: f64,
    #[serde(default = "default_primary_bonus")]
    pub primary_bonus: f64,
    #[serde(default = "default_backup_bonus")]
    pub backup_bonus: f64,
    #[serde(default = "default_async_store_bonus")]
    pub async_store_bonus: f64,
    #[serde(default = "default_snapshot_bonus")]
    pub snapshot_bonus: f64,
}

fn default_count_weight() -> f64 {
    10.0
}

fn default_recency_horizon_hours() -> f64 {
    100.0
}

fn default_primary_bonus() -> f64 {
    100.0
}

fn default_backup_bonus() -> f64 {
    90.0
}

fn default_async_store_bonus() -> f64 {
    85.0
}

fn default_snapshot_bonus() -> f64 {
    50.0
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            count_weight: default_count_weight(),
            recency_horizon_hours: default_recency_horizon_hours(),
            primary_bonus: default_primary_bonus(),
            backup_bonus: default_backup_bonus(),
            async_store_bonus: default_async_store_bonus(),
            snapshot_bonus: default_snapshot_bonus(),
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("scoring.count_weight", self.count_weight),
            ("scoring.recency_horizon_hours", self.recency_horizon_hours),
            ("scoring.primary_bonus", self.primary_bonus),
            ("scoring.backup_bonus", self.backup_bonus),
            ("scoring.async_store_bonus", self.async_store_bonus),
            ("scoring.snapshot_bonus", self.snapshot_bonus),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// One readable dataset offered to selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tier: SourceTier,
    pub key: String,
    pub snapshot: Snapshot,
}

impl Candidate {
    #[must_use]
    pub fn new(tier: SourceTier, key: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            tier,
            key: key.into(),
            snapshot,
        }
    }
}

/// A candidate with its computed score attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub tier: SourceTier,
    pub key: String,
    pub score: f64,
    pub snapshot: Snapshot,
}

impl RankedCandidate {
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.snapshot.record_count()
    }
}

/// Score one snapshot as seen from `now_ms`.
#[must_use]
pub fn score(snapshot: &Snapshot, tier: SourceTier, now_ms: i64, weights: &ScoringWeights) -> f64 {
    let count_score = weights.count_weight * snapshot.record_count() as f64;
    let recency_score = (weights.recency_horizon_hours - snapshot.age_hours(now_ms)).max(0.0);
    count_score + recency_score + tier.bonus(weights)
}

/// Order candidates best first.
///
/// Equal scores resolve by tier (most trusted wins), then by key, so the
/// same inputs always produce the same ranking.
#[must_use]
pub fn rank(
    candidates: Vec<Candidate>,
    now_ms: i64,
    weights: &ScoringWeights,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|c| {
            let score = score(&c.snapshot, c.tier, now_ms, weights);
            RankedCandidate {
                tier: c.tier,
                key: c.key,
                score,
                snapshot: c.snapshot,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.tier.cmp(&b.tier))
            .then_with(|| a.key.cmp(&b.key))
    });
    ranked
}

/// Pick the winning candidate, or report exhaustion when there are none.
pub fn select_best(
    candidates: Vec<Candidate>,
    now_ms: i64,
    weights: &ScoringWeights,
) -> Result<RankedCandidate, RecoveryError> {
    rank(candidates, now_ms, weights)
        .into_iter()
        .next()
        .ok_or(RecoveryError::Exhausted)
}

/// Lifecycle of the consistency machinery.
///
/// Transitions run one way per pass: a sweep moves out of
/// `Uninitialized` into `Checking`, lands in `Consistent` directly or via
/// `Recovering`, and stops there. A recovered dataset is never fed
/// straight back into another sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Checking,
    Recovering,
    Consistent,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Checking => "checking",
            Self::Recovering => "recovering",
            Self::Consistent => "consistent",
        };
        f.write_str(label)
    }
}
