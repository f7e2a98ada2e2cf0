//! The vault: one facade over the roster, both stores, and recovery.
//!
//! Locking discipline: the roster sits behind a `parking_lot::RwLock` and
//! no lock is ever held across an await point. Mutations capture what they
//! need under the lock, release it, then do slow work. The critical
//! checkpoint path is fully synchronous so it can run while a runtime is
//! tearing down.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::error::{Error, RecoveryError, Result, StoreError};
use crate::events::{EventBus, VaultEvent};
use crate::integrity::{self, CountSource, IntegrityReport, ObservedCount};
use crate::kv_store::{KvStore, KvStoreConfig};
use crate::model::{Contact, ContactDraft, ContactId, ContactPatch, Group, GroupId};
use crate::recovery::{self, Candidate, EngineState, SourceTier};
use crate::roster::{Roster, RosterFilter};
use crate::snapshot::{
    BACKUP_KEY, CRITICAL_MARKER_KEY, CheckpointTrigger, CriticalMarker, GROUPS_BACKUP_KEY,
    GROUPS_PRIMARY_KEY, PRIMARY_KEY, Snapshot, SnapshotKind, TIMESTAMPED_PREFIXES, critical_key,
    fallback_key, full_key, now_ms, rapid_key,
};
use crate::sql_store::{SqlStore, StoredSummary};

/// Result of one backup pass, shaped for direct serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupReceipt {
    pub success: bool,
    pub kind: SnapshotKind,
    pub key: String,
    pub record_count: usize,
    pub group_count: usize,
    pub captured_at_ms: i64,
    /// Set by [`Vault::manual_backup`]: whether its checkpoint marker landed.
    pub marker_saved: Option<bool>,
}

/// What a synchronous checkpoint managed to write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub trigger: CheckpointTrigger,
    pub keys_written: Vec<String>,
    pub marker_saved: bool,
    pub captured_at_ms: i64,
}

/// Counts from one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub kv_scanned: usize,
    pub kv_deleted: usize,
    pub sql_deleted: usize,
}

/// A completed restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub source: SourceTier,
    pub key: String,
    pub score: f64,
    pub record_count: usize,
    pub group_count: usize,
    pub restored_at_ms: i64,
}

/// End state of one consistency pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsistencyOutcome {
    /// Counts agreed; nothing to do.
    Consistent(IntegrityReport),
    /// Counts disagreed and a candidate was restored.
    Recovered {
        report: IntegrityReport,
        recovery: RecoveryOutcome,
    },
    /// Counts disagreed but no location offered a readable dataset.
    Exhausted(IntegrityReport),
}

/// Point-in-time view of the engine for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub state: EngineState,
    pub record_count: usize,
    pub group_count: usize,
    pub dirty: bool,
    pub last_modified_ms: i64,
    pub kv_payload_bytes: u64,
    pub kv_quota_bytes: u64,
    pub stored_snapshots: u64,
    pub newest_stored: Option<StoredSummary>,
    pub last_checkpoint: Option<CriticalMarker>,
}

pub struct Vault {
    config: VaultConfig,
    roster: RwLock<Roster>,
    pub(crate) kv: KvStore,
    pub(crate) sql: SqlStore,
    events: EventBus,
    state: Mutex<EngineState>,
}

impl Vault {
    /// Open both stores and start with an empty roster.
    ///
    /// Callers that want the persisted dataset back call [`Vault::hydrate`]
    /// next; tests and importers may prefer to stay empty.
    pub fn open(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let kv = KvStore::open(
            KvStoreConfig::new(config.storage.kv_path())
                .with_quota(config.storage.kv_quota_bytes),
        )?;
        let sql = SqlStore::open(config.storage.db_path().to_string_lossy().into_owned())?;
        Ok(Self {
            config,
            roster: RwLock::new(Roster::new()),
            kv,
            sql,
            events: EventBus::default(),
            state: Mutex::new(EngineState::Uninitialized),
        })
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Load the persisted dataset into memory, primary mirror first.
    ///
    /// Returns which mirror supplied the data, or `None` when starting
    /// fresh. The roster comes up clean: loading is not a modification.
    pub fn hydrate(&self) -> Option<SourceTier> {
        let (tier, contacts_mirror) = match self.read_mirror(PRIMARY_KEY) {
            Some(snapshot) => (SourceTier::Primary, snapshot),
            None => match self.read_mirror(BACKUP_KEY) {
                Some(snapshot) => (SourceTier::Backup, snapshot),
                None => {
                    debug!("no mirror present, starting with an empty dataset");
                    return None;
                }
            },
        };
        let groups = self.read_groups_for(tier);
        let now = now_ms();
        let mut roster = self.roster.write();
        roster.replace_all(contacts_mirror.contacts, groups, now);
        roster.clear_dirty();
        info!(
            source = %tier,
            records = roster.len(),
            groups = roster.group_count(),
            "hydrated dataset"
        );
        Some(tier)
    }

    // ── Contact and group operations ────────────────────────────────────

    pub fn add_contact(&self, draft: ContactDraft) -> Result<Contact> {
        self.roster.write().add(draft, now_ms())
    }

    pub fn update_contact(&self, id: ContactId, patch: &ContactPatch) -> Result<Contact> {
        self.roster.write().update(id, patch, now_ms())
    }

    pub fn delete_contact(&self, id: ContactId) -> Result<()> {
        self.roster.write().delete(id, now_ms())
    }

    pub fn toggle_favorite(&self, id: ContactId) -> Result<Contact> {
        self.roster.write().toggle_favorite(id, now_ms())
    }

    pub fn toggle_block(&self, id: ContactId) -> Result<Contact> {
        self.roster.write().toggle_block(id, now_ms())
    }

    #[must_use]
    pub fn contacts(&self, filter: Option<&RosterFilter>) -> Vec<Contact> {
        self.roster.read().get_all(filter)
    }

    #[must_use]
    pub fn contact(&self, id: ContactId) -> Option<Contact> {
        self.roster.read().get(id)
    }

    pub fn add_group(&self, label: &str) -> Result<Group> {
        self.roster.write().add_group(label, now_ms())
    }

    pub fn remove_group(&self, id: GroupId) -> Result<()> {
        self.roster.write().remove_group(id, now_ms())
    }

    pub fn assign_group(&self, contact: ContactId, group: GroupId) -> Result<Contact> {
        self.roster.write().assign_group(contact, group, now_ms())
    }

    pub fn unassign_group(&self, contact: ContactId, group: GroupId) -> Result<Contact> {
        self.roster.write().unassign_group(contact, group, now_ms())
    }

    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        self.roster.read().groups()
    }

    #[must_use]
    pub fn group_members(&self, id: GroupId) -> Vec<Contact> {
        self.roster.read().group_members(id)
    }

    /// Unsorted full dataset, for export surfaces.
    #[must_use]
    pub fn dataset(&self) -> (Vec<Contact>, Vec<Group>) {
        self.roster.read().dataset()
    }

    /// Swap in an imported dataset and persist it everywhere.
    pub async fn import_dataset(&self, contacts: Vec<Contact>, groups: Vec<Group>) -> Result<()> {
        let now = now_ms();
        let snapshot = {
            let mut roster = self.roster.write();
            roster.replace_all(contacts, groups, now);
            let (contacts, groups) = roster.dataset();
            Snapshot::capture(contacts, groups, now, Some(SnapshotKind::Full), None)
        };
        self.persist_everywhere(&snapshot).await?;
        self.roster.write().clear_dirty();
        Ok(())
    }

    // ── Backups ─────────────────────────────────────────────────────────

    /// Cheap frequent pass: nothing to do unless something changed.
    ///
    /// Writes one snapshot to the structured store only, then clears the
    /// dirty flag. A failed write re-arms the flag so the next pass tries
    /// again.
    pub async fn rapid_backup(&self) -> Result<Option<BackupReceipt>> {
        let now = now_ms();
        let snapshot = {
            let mut roster = self.roster.write();
            if !roster.is_dirty() {
                return Ok(None);
            }
            let (contacts, groups) = roster.dataset();
            roster.clear_dirty();
            Snapshot::capture(contacts, groups, now, Some(SnapshotKind::Rapid), None)
        };
        let key = rapid_key(now);
        if let Err(e) = self.sql.put(&key, &snapshot.clone().for_location(&key)).await {
            warn!(key = %key, error = %e, "rapid snapshot write failed");
            self.roster.write().mark_dirty();
            return Err(e.into());
        }
        debug!(key = %key, records = snapshot.record_count(), "rapid snapshot written");
        let receipt = make_receipt(SnapshotKind::Rapid, key, &snapshot);
        self.events.publish(VaultEvent::BackupCompleted {
            kind: SnapshotKind::Rapid,
            key: receipt.key.clone(),
            record_count: receipt.record_count,
            timestamp_ms: now,
        });
        Ok(Some(receipt))
    }

    /// Unconditional pass: mirrors into the bounded store plus one
    /// snapshot in the structured store.
    ///
    /// The captured snapshot is returned so callers can forward it to a
    /// remote best-effort sink.
    pub async fn full_backup(&self) -> Result<(BackupReceipt, Snapshot)> {
        let now = now_ms();
        let snapshot = {
            let mut roster = self.roster.write();
            let (contacts, groups) = roster.dataset();
            roster.clear_dirty();
            Snapshot::capture(contacts, groups, now, Some(SnapshotKind::Full), None)
        };
        match self.persist_everywhere(&snapshot).await {
            Ok(key) => {
                let receipt = make_receipt(SnapshotKind::Full, key, &snapshot);
                self.events.publish(VaultEvent::BackupCompleted {
                    kind: SnapshotKind::Full,
                    key: receipt.key.clone(),
                    record_count: receipt.record_count,
                    timestamp_ms: now,
                });
                Ok((receipt, snapshot))
            }
            Err(e) => {
                self.roster.write().mark_dirty();
                Err(e)
            }
        }
    }

    /// On-demand save: a full snapshot to every location plus a
    /// teardown-grade checkpoint, so the bounded store's mirrors and
    /// marker are fresh too. An empty dataset is a valid thing to back up.
    pub async fn manual_backup(&self) -> Result<BackupReceipt> {
        let (mut receipt, _) = self.full_backup().await?;
        let checkpoint = self.critical_checkpoint(CheckpointTrigger::Terminating)?;
        receipt.marker_saved = Some(checkpoint.marker_saved);
        Ok(receipt)
    }

    /// Synchronous teardown checkpoint. No awaits on this path.
    ///
    /// Succeeds once the dataset landed under at least two independent
    /// keys in the bounded store; the marker and group mirrors are
    /// best-effort on top.
    pub fn critical_checkpoint(&self, trigger: CheckpointTrigger) -> Result<CheckpointOutcome> {
        let now = now_ms();
        let (contacts, groups) = self.roster.read().dataset();
        let full = Snapshot::capture(
            contacts,
            groups,
            now,
            Some(SnapshotKind::Critical),
            Some(trigger),
        );
        let (contacts_mirror, groups_mirror) = mirror_pair(&full);

        let mut keys_written: Vec<String> = Vec::new();
        let mut dataset_copies = 0usize;
        let mut last_err: Option<StoreError> = None;

        let dataset_targets = [
            (PRIMARY_KEY.to_string(), &contacts_mirror, 0usize),
            (BACKUP_KEY.to_string(), &contacts_mirror, 1usize),
            (critical_key(trigger, now), &full, 2usize),
        ];
        for (key, payload, slot) in dataset_targets {
            match self.put_with_fallback(&key, payload, now, slot) {
                Ok(landed) => {
                    dataset_copies += 1;
                    keys_written.push(landed);
                }
                Err(e) => last_err = Some(e),
            }
        }
        for (key, slot) in [(GROUPS_PRIMARY_KEY, 3usize), (GROUPS_BACKUP_KEY, 4usize)] {
            match self.put_with_fallback(key, &groups_mirror, now, slot) {
                Ok(landed) => keys_written.push(landed),
                Err(e) => warn!(key = %key, error = %e, "group mirror write failed"),
            }
        }

        if dataset_copies < 2 {
            let detail = last_err
                .map_or_else(|| "unknown write failure".to_string(), |e| e.to_string());
            warn!(copies = dataset_copies, error = %detail, "checkpoint below redundancy floor");
            return Err(Error::Store(StoreError::WriteFailed {
                key: critical_key(trigger, now),
                detail,
            }));
        }

        let marker = CriticalMarker {
            last_saved_at_ms: now,
            trigger,
        };
        let marker_saved = match serde_json::to_string(&marker) {
            Ok(payload) => match self.kv.put(CRITICAL_MARKER_KEY, &payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "checkpoint marker write failed");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "checkpoint marker serialize failed");
                false
            }
        };

        info!(
            trigger = %trigger,
            keys = keys_written.len(),
            records = full.record_count(),
            "critical checkpoint saved"
        );
        self.events.publish(VaultEvent::CheckpointSaved {
            trigger,
            keys_written: keys_written.len(),
            timestamp_ms: now,
        });
        Ok(CheckpointOutcome {
            trigger,
            keys_written,
            marker_saved,
            captured_at_ms: now,
        })
    }

    /// Drop timestamped snapshots older than the retention window.
    ///
    /// Age is judged by each payload's embedded capture timestamp; key
    /// names never enter into it. Unparseable timestamped payloads are
    /// deleted too, since they can never be restored from.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        let now = now_ms();
        let retention = self.config.scheduler.retention();
        let mut report = CleanupReport::default();

        for prefix in TIMESTAMPED_PREFIXES {
            for key in self.kv.keys_with_prefix(prefix) {
                report.kv_scanned += 1;
                let prune = match self.kv.get(&key) {
                    Some(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                        Ok(snapshot) => snapshot.expired(now, retention),
                        Err(e) => {
                            warn!(key = %key, error = %e, "dropping unreadable snapshot");
                            true
                        }
                    },
                    None => false,
                };
                if prune {
                    self.kv.delete(&key)?;
                    report.kv_deleted += 1;
                }
            }
        }

        let cutoff = now.saturating_sub(retention.as_millis() as i64);
        for key in self.sql.keys_captured_before(cutoff).await? {
            self.sql.delete(&key).await?;
            report.sql_deleted += 1;
        }

        if report.kv_deleted > 0 || report.sql_deleted > 0 {
            info!(
                kv_deleted = report.kv_deleted,
                sql_deleted = report.sql_deleted,
                "retention sweep pruned snapshots"
            );
        }
        Ok(report)
    }

    // ── Integrity and recovery ──────────────────────────────────────────

    /// Compare record counts across every readable source.
    ///
    /// Read-only: no state transition, no recovery. Sources that are
    /// absent or unreadable are skipped rather than counted as zero.
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let counts = self.observed_counts().await?;
        let report = integrity::evaluate(counts, &self.config.integrity, now_ms());
        if report.flagged {
            warn!(
                max = report.max_count,
                min = report.min_count,
                allowed = report.allowed_gap,
                "record counts diverged"
            );
        } else {
            debug!(max = report.max_count, min = report.min_count, "counts agree");
        }
        Ok(report)
    }

    /// One full consistency pass: sweep, and restore if the sweep flags.
    ///
    /// The pass always lands in `Consistent`. A restored dataset is not
    /// fed back into another sweep; the next scheduled pass sees it.
    pub async fn check_and_recover(&self) -> Result<ConsistencyOutcome> {
        *self.state.lock() = EngineState::Checking;
        let report = match self.check_integrity().await {
            Ok(report) => report,
            Err(e) => {
                *self.state.lock() = EngineState::Consistent;
                return Err(e);
            }
        };
        if !report.flagged {
            *self.state.lock() = EngineState::Consistent;
            return Ok(ConsistencyOutcome::Consistent(report));
        }

        self.events.publish(VaultEvent::IntegrityFlagged {
            max_count: report.max_count,
            min_count: report.min_count,
            allowed_gap: report.allowed_gap,
            timestamp_ms: report.checked_at_ms,
        });
        *self.state.lock() = EngineState::Recovering;
        let outcome = match self.recover().await {
            Ok(recovery) => Ok(ConsistencyOutcome::Recovered { report, recovery }),
            Err(Error::Recovery(RecoveryError::Exhausted)) => {
                self.events.publish(VaultEvent::RecoveryIssue {
                    detail: "no recoverable dataset found in any storage location".to_string(),
                    timestamp_ms: now_ms(),
                });
                Ok(ConsistencyOutcome::Exhausted(report))
            }
            Err(e) => Err(e),
        };
        *self.state.lock() = EngineState::Consistent;
        outcome
    }

    /// Gather every readable candidate, restore the best one, and
    /// re-persist it to all locations.
    pub async fn recover(&self) -> Result<RecoveryOutcome> {
        let now = now_ms();
        let candidates = self.gather_candidates().await?;
        debug!(candidates = candidates.len(), "recovery candidates gathered");
        let winner = recovery::select_best(candidates, now, &self.config.scoring)
            .map_err(Error::Recovery)?;

        info!(
            source = %winner.tier,
            key = %winner.key,
            score = winner.score,
            records = winner.snapshot.record_count(),
            "restoring dataset"
        );
        let restored = Snapshot::capture(
            winner.snapshot.contacts.clone(),
            winner.snapshot.groups.clone(),
            now,
            Some(SnapshotKind::Full),
            None,
        );
        {
            let mut roster = self.roster.write();
            roster.replace_all(
                winner.snapshot.contacts.clone(),
                winner.snapshot.groups.clone(),
                now,
            );
        }
        if let Err(e) = self.persist_everywhere(&restored).await {
            warn!(error = %e, "re-persist after restore failed");
            return Err(Error::Recovery(RecoveryError::Repersist(e.to_string())));
        }
        self.roster.write().clear_dirty();

        let outcome = RecoveryOutcome {
            source: winner.tier,
            key: winner.key,
            score: winner.score,
            record_count: restored.record_count(),
            group_count: restored.group_count(),
            restored_at_ms: now,
        };
        self.events.publish(VaultEvent::Recovered {
            source: outcome.source,
            record_count: outcome.record_count,
            group_count: outcome.group_count,
            timestamp_ms: now,
        });
        Ok(outcome)
    }

    /// Current engine view for status surfaces.
    pub async fn status(&self) -> Result<VaultStatus> {
        let (record_count, group_count, dirty, last_modified_ms) = {
            let roster = self.roster.read();
            (
                roster.len(),
                roster.group_count(),
                roster.is_dirty(),
                roster.last_modified_ms(),
            )
        };
        let last_checkpoint = self
            .kv
            .get(CRITICAL_MARKER_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok());
        Ok(VaultStatus {
            state: self.state(),
            record_count,
            group_count,
            dirty,
            last_modified_ms,
            kv_payload_bytes: self.kv.payload_bytes(),
            kv_quota_bytes: self.kv.quota_bytes(),
            stored_snapshots: self.sql.len().await?,
            newest_stored: self.sql.newest_summary().await?,
            last_checkpoint,
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Parse a mirror out of the bounded store. Corrupt payloads read as
    /// absent; they are skipped, never fatal.
    fn read_mirror(&self, key: &str) -> Option<Snapshot> {
        let raw = self.kv.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(key = %key, error = %e, "mirror unreadable, treating as absent");
                None
            }
        }
    }

    fn read_groups_for(&self, tier: SourceTier) -> Vec<Group> {
        let key = match tier {
            SourceTier::Backup => GROUPS_BACKUP_KEY,
            _ => GROUPS_PRIMARY_KEY,
        };
        self.read_mirror(key)
            .or_else(|| self.read_mirror(GROUPS_BACKUP_KEY))
            .map(|s| s.groups)
            .unwrap_or_default()
    }

    /// Write to `key`, falling back to a timestamped alternate location
    /// when the first write fails. Returns the key that actually took the
    /// payload; errors only when both locations refused it.
    fn put_with_fallback(
        &self,
        key: &str,
        snapshot: &Snapshot,
        now: i64,
        slot: usize,
    ) -> std::result::Result<String, StoreError> {
        let payload = serde_json::to_string(&snapshot.clone().for_location(key))?;
        match self.kv.put(key, &payload) {
            Ok(()) => return Ok(key.to_string()),
            Err(e) => {
                warn!(key = %key, error = %e, "write failed, retrying on alternate key");
            }
        }
        let alternate = fallback_key(now, slot);
        let payload = serde_json::to_string(&snapshot.clone().for_location(&alternate))?;
        match self.kv.put(&alternate, &payload) {
            Ok(()) => Ok(alternate),
            Err(e) => {
                warn!(key = %alternate, error = %e, "alternate write failed");
                Err(e)
            }
        }
    }

    /// Persist one full snapshot to every location: both contact mirrors,
    /// both group mirrors, and a dated entry in the structured store.
    ///
    /// Returns the structured-store key. Fails only when no copy of the
    /// dataset landed anywhere.
    async fn persist_everywhere(&self, snapshot: &Snapshot) -> Result<String> {
        let now = snapshot.captured_at_ms;
        let (contacts_mirror, groups_mirror) = mirror_pair(snapshot);
        let mut dataset_copies = 0usize;
        let mut last_err: Option<StoreError> = None;

        for (key, slot) in [(PRIMARY_KEY, 0usize), (BACKUP_KEY, 1usize)] {
            match self.put_with_fallback(key, &contacts_mirror, now, slot) {
                Ok(_) => dataset_copies += 1,
                Err(e) => last_err = Some(e),
            }
        }
        for (key, slot) in [(GROUPS_PRIMARY_KEY, 3usize), (GROUPS_BACKUP_KEY, 4usize)] {
            if let Err(e) = self.put_with_fallback(key, &groups_mirror, now, slot) {
                warn!(key = %key, error = %e, "group mirror write failed");
            }
        }

        let sql_key = full_key(now);
        match self
            .sql
            .put(&sql_key, &snapshot.clone().for_location(&sql_key))
            .await
        {
            Ok(()) => dataset_copies += 1,
            Err(e) => {
                warn!(key = %sql_key, error = %e, "structured store write failed");
                last_err = Some(e);
            }
        }

        if dataset_copies == 0 {
            let err = last_err.unwrap_or(StoreError::WriteFailed {
                key: sql_key,
                detail: "no location accepted the snapshot".to_string(),
            });
            return Err(err.into());
        }
        debug!(
            copies = dataset_copies,
            records = snapshot.record_count(),
            "snapshot persisted"
        );
        Ok(sql_key)
    }

    async fn observed_counts(&self) -> Result<Vec<ObservedCount>> {
        let mut counts = vec![ObservedCount::new(CountSource::Memory, self.roster.read().len())];
        if let Some(snapshot) = self.read_mirror(PRIMARY_KEY) {
            counts.push(ObservedCount::new(
                CountSource::Primary,
                snapshot.record_count(),
            ));
        }
        if let Some(snapshot) = self.read_mirror(BACKUP_KEY) {
            counts.push(ObservedCount::new(
                CountSource::Backup,
                snapshot.record_count(),
            ));
        }
        match self.sql.newest_summary().await {
            Ok(Some(summary)) => counts.push(ObservedCount::new(
                CountSource::AsyncStore,
                summary.record_count,
            )),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "structured store unreadable, skipping its count");
            }
        }
        Ok(counts)
    }

    /// Every readable dataset copy, tiered by where it came from.
    async fn gather_candidates(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for (key, tier) in [
            (PRIMARY_KEY, SourceTier::Primary),
            (BACKUP_KEY, SourceTier::Backup),
        ] {
            if let Some(mirror) = self.read_mirror(key) {
                let mut snapshot = mirror;
                if snapshot.groups.is_empty() {
                    snapshot.groups = self.read_groups_for(tier);
                }
                candidates.push(Candidate::new(tier, key, snapshot));
            }
        }

        for prefix in TIMESTAMPED_PREFIXES {
            for key in self.kv.keys_with_prefix(prefix) {
                if let Some(snapshot) = self.read_mirror(&key) {
                    candidates.push(Candidate::new(SourceTier::Snapshot, key, snapshot));
                }
            }
        }

        // A broken structured store contributes nothing; the bounded
        // store's copies are still in play.
        let newest = match self.sql.newest_summary().await {
            Ok(newest) => newest,
            Err(e) => {
                warn!(error = %e, "structured store unreadable, skipping its candidates");
                None
            }
        };
        let stored_keys = match self.sql.keys_with_prefix("contacts.").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "structured store listing failed, skipping its candidates");
                Vec::new()
            }
        };
        for key in stored_keys {
            let tier = match &newest {
                Some(summary) if summary.key == key => SourceTier::AsyncStore,
                _ => SourceTier::Snapshot,
            };
            match self.sql.get(&key).await {
                Ok(Some(snapshot)) => candidates.push(Candidate::new(tier, key, snapshot)),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "stored snapshot unreadable, skipping");
                }
            }
        }

        Ok(candidates)
    }
}

fn make_receipt(kind: SnapshotKind, key: String, snapshot: &Snapshot) -> BackupReceipt {
    BackupReceipt {
        success: true,
        kind,
        key,
        record_count: snapshot.record_count(),
        group_count: snapshot.group_count(),
        captured_at_ms: snapshot.captured_at_ms,
        marker_saved: None,
    }
}

/// Split one full snapshot into the two legacy mirror payloads: contacts
/// without groups, and groups without contacts.
fn mirror_pair(full: &Snapshot) -> (Snapshot, Snapshot) {
    let contacts = Snapshot::capture(
        full.contacts.clone(),
        Vec::new(),
        full.captured_at_ms,
        full.kind,
        full.trigger,
    );
    let groups = Snapshot::capture(
        Vec::new(),
        full.groups.clone(),
        full.captured_at_ms,
        full.kind,
        full.trigger,
    );
    (contacts, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault_in(dir: &TempDir) -> Vault {
        Vault::open(VaultConfig::for_data_dir(dir.path())).unwrap()
    }

    fn seeded(vault: &Vault, count: usize) {
        for i in 0..count {
            vault
                .add_contact(ContactDraft::new(format!("contact {i:02}")))
                .unwrap();
        }
    }

    fn snapshot_of(count: usize, captured_at_ms: i64) -> Snapshot {
        let contacts: Vec<Contact> = (0..count)
            .map(|i| Contact::create(ContactDraft::new(format!("c{i}")), captured_at_ms).unwrap())
            .collect();
        Snapshot::capture(contacts, Vec::new(), captured_at_ms, None, None)
    }

    // ── Facade basics ───────────────────────────────────────────────────

    #[tokio::test]
    async fn add_and_list_through_the_facade() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        vault
            .add_contact(ContactDraft::new("Marie").with_email("marie@curie.fr"))
            .unwrap();
        let all = vault.contacts(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].email.as_deref(), Some("marie@curie.fr"));
        assert_eq!(vault.state(), EngineState::Uninitialized);
    }

    // ── Critical checkpoint ─────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_writes_redundant_keys_and_marker() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        seeded(&vault, 3);

        let outcome = vault
            .critical_checkpoint(CheckpointTrigger::Terminating)
            .unwrap();
        assert!(outcome.keys_written.len() >= 2);
        assert!(outcome.marker_saved);
        assert!(vault.kv.get(PRIMARY_KEY).is_some());
        assert!(vault.kv.get(BACKUP_KEY).is_some());
        assert_eq!(vault.kv.keys_with_prefix("contacts.critical.").len(), 1);

        let marker: CriticalMarker =
            serde_json::from_str(&vault.kv.get(CRITICAL_MARKER_KEY).unwrap()).unwrap();
        assert_eq!(marker.trigger, CheckpointTrigger::Terminating);
        assert_eq!(marker.last_saved_at_ms, outcome.captured_at_ms);
    }

    #[tokio::test]
    async fn checkpoint_survives_process_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let vault = vault_in(&dir);
            seeded(&vault, 4);
            vault.add_group("Friends").unwrap();
            vault.critical_checkpoint(CheckpointTrigger::Hidden).unwrap();
        }
        let reopened = vault_in(&dir);
        assert_eq!(reopened.hydrate(), Some(SourceTier::Primary));
        assert_eq!(reopened.contacts(None).len(), 4);
        assert_eq!(reopened.groups().len(), 1);
        assert!(!reopened.roster.read().is_dirty());
    }

    // ── Scheduled backups ───────────────────────────────────────────────

    #[tokio::test]
    async fn rapid_backup_skips_clean_roster() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        assert!(vault.rapid_backup().await.unwrap().is_none());

        seeded(&vault, 2);
        let receipt = vault.rapid_backup().await.unwrap().unwrap();
        assert_eq!(receipt.record_count, 2);
        assert_eq!(receipt.kind, SnapshotKind::Rapid);

        // Flag cleared; a second pass has nothing to do.
        assert!(vault.rapid_backup().await.unwrap().is_none());
        assert_eq!(vault.sql.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_backup_writes_mirrors_and_structured_store() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        seeded(&vault, 5);

        let (receipt, snapshot) = vault.full_backup().await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.record_count, 5);
        assert_eq!(snapshot.kind, Some(SnapshotKind::Full));
        assert!(vault.kv.get(PRIMARY_KEY).is_some());
        assert!(vault.kv.get(BACKUP_KEY).is_some());
        assert!(vault.kv.get(GROUPS_PRIMARY_KEY).is_some());
        assert_eq!(vault.sql.get(&receipt.key).await.unwrap().unwrap().record_count(), 5);
    }

    #[tokio::test]
    async fn manual_backup_of_empty_store_reports_zero_records() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        let receipt = vault.manual_backup().await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.record_count, 0);
    }

    #[tokio::test]
    async fn manual_backup_also_lands_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        seeded(&vault, 2);

        let receipt = vault.manual_backup().await.unwrap();
        assert_eq!(receipt.marker_saved, Some(true));

        let marker: CriticalMarker =
            serde_json::from_str(&vault.kv.get(CRITICAL_MARKER_KEY).unwrap()).unwrap();
        assert_eq!(marker.trigger, CheckpointTrigger::Terminating);
        assert_eq!(vault.kv.keys_with_prefix("contacts.critical.").len(), 1);
    }

    // ── Retention ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_prunes_by_embedded_timestamp_only() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        let now = now_ms();
        let eight_days = 8 * 24 * 3_600_000;

        let stale = snapshot_of(1, now - eight_days);
        let fresh = snapshot_of(1, now - 60_000);
        vault
            .kv
            .put("contacts.critical.hidden.1", &serde_json::to_string(&stale).unwrap())
            .unwrap();
        vault
            .kv
            .put("contacts.critical.hidden.2", &serde_json::to_string(&fresh).unwrap())
            .unwrap();
        vault.sql.put("contacts.rapid.old", &stale).await.unwrap();
        vault.sql.put("contacts.rapid.new", &fresh).await.unwrap();

        let report = vault.cleanup_expired().await.unwrap();
        assert_eq!(report.kv_deleted, 1);
        assert_eq!(report.sql_deleted, 1);
        assert!(vault.kv.get("contacts.critical.hidden.2").is_some());
        assert!(vault.sql.get("contacts.rapid.new").await.unwrap().is_some());
    }

    // ── Integrity and recovery ──────────────────────────────────────────

    #[tokio::test]
    async fn matching_counts_stay_consistent() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        seeded(&vault, 10);
        vault.full_backup().await.unwrap();

        let outcome = vault.check_and_recover().await.unwrap();
        assert!(matches!(outcome, ConsistencyOutcome::Consistent(_)));
        assert_eq!(vault.state(), EngineState::Consistent);
        assert_eq!(vault.contacts(None).len(), 10);
    }

    #[tokio::test]
    async fn divergent_counts_trigger_restore_from_best_source() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        let mut events = vault.events().subscribe();
        let now = now_ms();
        let week = 7 * 24 * 3_600_000;

        // Backup mirror holds ten records, the structured store four, the
        // roster none. Backup scores 190 against the store's 125.
        let backup = snapshot_of(10, now - week);
        vault
            .kv
            .put(BACKUP_KEY, &serde_json::to_string(&backup).unwrap())
            .unwrap();
        vault
            .sql
            .put("contacts.full.2023-11-01", &snapshot_of(4, now - week))
            .await
            .unwrap();

        let outcome = vault.check_and_recover().await.unwrap();
        let ConsistencyOutcome::Recovered { recovery, .. } = outcome else {
            panic!("expected a recovery, got {outcome:?}");
        };
        assert_eq!(recovery.source, SourceTier::Backup);
        assert_eq!(recovery.record_count, 10);
        assert_eq!(vault.contacts(None).len(), 10);
        assert_eq!(vault.state(), EngineState::Consistent);

        // Restored dataset was re-persisted to the primary mirror.
        let primary: Snapshot =
            serde_json::from_str(&vault.kv.get(PRIMARY_KEY).unwrap()).unwrap();
        assert_eq!(primary.record_count(), 10);

        let mut saw_flag = false;
        let mut saw_recovered = false;
        while let Ok(event) = events.try_recv() {
            match event {
                VaultEvent::IntegrityFlagged { .. } => saw_flag = true,
                VaultEvent::Recovered { source, record_count, .. } => {
                    saw_recovered = true;
                    assert_eq!(source, SourceTier::Backup);
                    assert_eq!(record_count, 10);
                }
                _ => {}
            }
        }
        assert!(saw_flag);
        assert!(saw_recovered);
    }

    #[tokio::test]
    async fn recovery_with_nothing_readable_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        let err = vault.recover().await.unwrap_err();
        assert!(matches!(err, Error::Recovery(RecoveryError::Exhausted)));
    }

    #[tokio::test]
    async fn unreadable_structured_store_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        let healthy = snapshot_of(10, now_ms());
        vault
            .kv
            .put(PRIMARY_KEY, &serde_json::to_string(&healthy).unwrap())
            .unwrap();
        vault
            .kv
            .put(BACKUP_KEY, &serde_json::to_string(&healthy).unwrap())
            .unwrap();
        std::fs::write(dir.path().join("vault.db"), b"not a database").unwrap();

        // Memory holds nothing, the mirrors hold ten. The broken database
        // must stop neither the sweep nor the restore.
        let outcome = vault.check_and_recover().await.unwrap();
        let ConsistencyOutcome::Recovered { report, recovery } = outcome else {
            panic!("expected a recovery, got {outcome:?}");
        };
        assert!(report.flagged);
        assert_eq!(recovery.source, SourceTier::Primary);
        assert_eq!(recovery.record_count, 10);
        assert_eq!(vault.contacts(None).len(), 10);
    }

    #[tokio::test]
    async fn corrupt_mirror_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        vault.kv.put(PRIMARY_KEY, "not json at all").unwrap();
        assert!(vault.hydrate().is_none());
        assert!(vault.read_mirror(PRIMARY_KEY).is_none());
    }

    #[tokio::test]
    async fn import_dataset_replaces_and_persists() {
        let dir = TempDir::new().unwrap();
        let vault = vault_in(&dir);
        seeded(&vault, 1);

        let incoming = snapshot_of(3, now_ms());
        vault
            .import_dataset(incoming.contacts.clone(), incoming.groups.clone())
            .await
            .unwrap();
        assert_eq!(vault.contacts(None).len(), 3);
        assert!(!vault.roster.read().is_dirty());
        assert!(vault.kv.get(PRIMARY_KEY).is_some());
    }
}
