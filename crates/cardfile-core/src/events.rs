//! Engine event stream.
//!
//! Mutating and recovery paths publish structured events over a broadcast
//! channel. Publishing never blocks and never fails: if nobody is
//! subscribed the event is dropped, and slow subscribers observe a lagged
//! error on their own receiver rather than stalling the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::recovery::SourceTier;
use crate::snapshot::{CheckpointTrigger, SnapshotKind};

/// Default buffered events per subscriber before lag kicks in.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Everything observable about the engine from the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    /// A scheduled or manual backup landed.
    BackupCompleted {
        kind: SnapshotKind,
        key: String,
        record_count: usize,
        timestamp_ms: i64,
    },
    /// A synchronous checkpoint was written.
    CheckpointSaved {
        trigger: CheckpointTrigger,
        keys_written: usize,
        timestamp_ms: i64,
    },
    /// The integrity sweep saw source counts drift past the tolerance.
    IntegrityFlagged {
        max_count: usize,
        min_count: usize,
        allowed_gap: f64,
        timestamp_ms: i64,
    },
    /// Recovery restored the dataset from the named source.
    Recovered {
        source: SourceTier,
        record_count: usize,
        group_count: usize,
        timestamp_ms: i64,
    },
    /// Recovery ran out of candidates; the dataset was left as found.
    RecoveryIssue { detail: String, timestamp_ms: i64 },
}

/// Fan-out handle shared by the engine and its background tasks.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget. A send error only means no receiver is listening.
    pub fn publish(&self, event: VaultEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
