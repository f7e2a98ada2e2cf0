//! Point-in-time dataset snapshots and the persisted key namespace.
//!
//! A snapshot is an immutable, complete contacts+groups pairing with an
//! embedded capture timestamp. Snapshots are superseded or pruned, never
//! edited. Retention decisions read the embedded timestamp only; key names
//! are namespace plumbing, not metadata.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{Contact, Group};

/// Schema version stamped into every snapshot this build writes.
///
/// Payloads without the field (written before versioning) deserialize as v1.
pub const SCHEMA_VERSION: u32 = 1;

// ── Key namespace ───────────────────────────────────────────────────────────
//
// contacts.primary                  current mirror, synchronous store
// contacts.backup                   redundant mirror, synchronous store
// contacts.groups.primary/.backup   group-list mirrors for the legacy split
// contacts.critical.<trigger>.<ts>  teardown checkpoint snapshots
// contacts.rapid.<date>             cheap dirty-flag snapshots, indexed store
// contacts.full.<date>              unconditional snapshots, both stores
// contacts.meta.critical            {last_saved_at_ms, trigger} marker

pub const PRIMARY_KEY: &str = "contacts.primary";
pub const BACKUP_KEY: &str = "contacts.backup";
pub const GROUPS_PRIMARY_KEY: &str = "contacts.groups.primary";
pub const GROUPS_BACKUP_KEY: &str = "contacts.groups.backup";
pub const CRITICAL_MARKER_KEY: &str = "contacts.meta.critical";

pub const CRITICAL_PREFIX: &str = "contacts.critical.";
pub const RAPID_PREFIX: &str = "contacts.rapid.";
pub const FULL_PREFIX: &str = "contacts.full.";

/// Prefixes holding timestamped snapshots subject to retention.
pub const TIMESTAMPED_PREFIXES: [&str; 3] = [CRITICAL_PREFIX, RAPID_PREFIX, FULL_PREFIX];

#[must_use]
pub fn critical_key(trigger: CheckpointTrigger, ts_ms: i64) -> String {
    format!("{CRITICAL_PREFIX}{}.{ts_ms}", trigger.label())
}

#[must_use]
pub fn rapid_key(ts_ms: i64) -> String {
    format!("{RAPID_PREFIX}{}", key_date(ts_ms))
}

#[must_use]
pub fn full_key(ts_ms: i64) -> String {
    format!("{FULL_PREFIX}{}", key_date(ts_ms))
}

/// Alternate location for a mirror write that failed outright.
///
/// Sits under the critical prefix so recovery scans and retention pruning
/// both see it without special cases.
#[must_use]
pub fn fallback_key(ts_ms: i64, slot: usize) -> String {
    format!("{CRITICAL_PREFIX}fallback.{ts_ms}.{slot}")
}

/// Whether a key lives under one of the timestamped snapshot prefixes.
#[must_use]
pub fn is_timestamped_key(key: &str) -> bool {
    TIMESTAMPED_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn key_date(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map_or_else(|| "1970-01-01".to_string(), |dt| dt.format("%Y-%m-%d").to_string())
}

/// Current wall clock as epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Snapshot values ─────────────────────────────────────────────────────────

/// Why a snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Cheap frequent capture, asynchronous store only.
    Rapid,
    /// Unconditional capture to every store.
    Full,
    /// Synchronous teardown checkpoint.
    Critical,
}

/// Host lifecycle moment that forced a synchronous checkpoint.
///
/// The hosting environment maps its own signals onto these; the save logic
/// itself is environment-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Surface became invisible to the user.
    Hidden,
    /// Input focus moved away.
    FocusLost,
    /// Network connectivity dropped.
    Offline,
    /// The process is about to terminate.
    Terminating,
    /// The host froze or suspended execution.
    Frozen,
}

impl CheckpointTrigger {
    /// Stable label used inside key names. Must never contain `.`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::FocusLost => "focus_lost",
            Self::Offline => "offline",
            Self::Terminating => "terminating",
            Self::Frozen => "frozen",
        }
    }
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable point-in-time serialization of the full dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub contacts: Vec<Contact>,
    pub groups: Vec<Group>,
    pub captured_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<CheckpointTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SnapshotKind>,
    /// Identity of the location this copy was written to.
    pub source_id: String,
}

fn default_schema_version() -> u32 {
    1
}

impl Snapshot {
    /// Capture a complete contacts+groups pairing.
    ///
    /// Partial snapshots cannot be expressed; callers always hand over both
    /// collections, empty or not.
    #[must_use]
    pub fn capture(
        contacts: Vec<Contact>,
        groups: Vec<Group>,
        captured_at_ms: i64,
        kind: Option<SnapshotKind>,
        trigger: Option<CheckpointTrigger>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            contacts,
            groups,
            captured_at_ms,
            trigger,
            kind,
            source_id: String::new(),
        }
    }

    /// Stamp the copy headed for one concrete storage location.
    #[must_use]
    pub fn for_location(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.contacts.len()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Retention check against the embedded timestamp only.
    ///
    /// Clock skew that puts the capture in the future reads as age zero.
    #[must_use]
    pub fn expired(&self, now_ms: i64, retention: Duration) -> bool {
        let age_ms = now_ms.saturating_sub(self.captured_at_ms).max(0);
        age_ms as u128 > retention.as_millis()
    }

    /// Age in fractional hours relative to `now_ms`, never negative.
    #[must_use]
    pub fn age_hours(&self, now_ms: i64) -> f64 {
        let age_ms = now_ms.saturating_sub(self.captured_at_ms).max(0);
        age_ms as f64 / 3_600_000.0
    }
}

/// Marker recorded after every successful critical checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalMarker {
    pub last_saved_at_ms: i64,
    pub trigger: CheckpointTrigger,
}
