//! Checksummed export/import archives.
//!
//! An archive is one JSON document holding a manifest and a full snapshot.
//! The manifest carries a SHA-256 over the serialized snapshot, so a
//! truncated or hand-edited file is rejected before it can replace
//! anything. Import regenerates every id on ingest and parks a safety
//! snapshot of the current dataset in the bounded store before the swap.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::diff::{DatasetDiff, DiffSummary};
use crate::engine::Vault;
use crate::error::{ArchiveError, Error, Result};
use crate::model::{Contact, ContactId, Group, GroupId};
use crate::snapshot::{CRITICAL_PREFIX, SCHEMA_VERSION, Snapshot, SnapshotKind, now_ms};

/// Metadata describing one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// cardfile version that wrote the archive.
    pub app_version: String,
    /// Snapshot schema the payload was written with.
    pub schema_version: u32,
    /// ISO-8601 creation time.
    pub created_at: String,
    pub record_count: usize,
    pub group_count: usize,
    /// Hex SHA-256 of the serialized snapshot payload.
    pub payload_sha256: String,
}

/// The on-disk archive document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub manifest: ArchiveManifest,
    pub snapshot: Snapshot,
}

/// What an export produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub path: PathBuf,
    pub manifest: ArchiveManifest,
}

/// Import behavior knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Verify and report without touching the dataset.
    pub dry_run: bool,
}

/// What an import did, or would have done under `dry_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReceipt {
    pub record_count: usize,
    pub group_count: usize,
    pub dry_run: bool,
    /// Bounded-store key holding the pre-import dataset, when one was
    /// written.
    pub safety_key: Option<String>,
    /// How the incoming dataset differs from the current one.
    pub diff: DiffSummary,
}

/// Write the current dataset as a checksummed archive at `path`.
pub fn export_archive(vault: &Vault, path: &Path) -> Result<ExportReceipt> {
    let (contacts, groups) = vault.dataset();
    let now = now_ms();
    let snapshot = Snapshot::capture(contacts, groups, now, Some(SnapshotKind::Full), None)
        .for_location("archive");

    let payload = serde_json::to_string(&snapshot)?;
    let manifest = ArchiveManifest {
        app_version: crate::VERSION.to_string(),
        schema_version: snapshot.schema_version,
        created_at: iso_time(now),
        record_count: snapshot.record_count(),
        group_count: snapshot.group_count(),
        payload_sha256: sha256_hex(payload.as_bytes()),
    };
    let archive = Archive {
        manifest: manifest.clone(),
        snapshot,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let text = serde_json::to_string_pretty(&archive)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text.as_bytes())?;
    fs::rename(&tmp, path)?;

    info!(
        path = %path.display(),
        records = manifest.record_count,
        groups = manifest.group_count,
        "archive exported"
    );
    Ok(ExportReceipt {
        path: path.to_path_buf(),
        manifest,
    })
}

/// Read and verify an archive without importing it.
pub fn read_archive(path: &Path) -> Result<Archive> {
    let text = fs::read_to_string(path)?;
    let archive: Archive = serde_json::from_str(&text)
        .map_err(|e| Error::Archive(ArchiveError::Malformed(e.to_string())))?;

    if archive.manifest.schema_version > SCHEMA_VERSION {
        return Err(Error::Archive(ArchiveError::SchemaTooNew {
            found: archive.manifest.schema_version,
            supported: SCHEMA_VERSION,
        }));
    }

    let payload = serde_json::to_string(&archive.snapshot)?;
    let actual = sha256_hex(payload.as_bytes());
    if actual != archive.manifest.payload_sha256 {
        return Err(Error::Archive(ArchiveError::ChecksumMismatch {
            expected: archive.manifest.payload_sha256.clone(),
            actual,
        }));
    }
    Ok(archive)
}

/// Replace the dataset with a verified archive's contents.
///
/// Ids are regenerated on ingest; group memberships are remapped through
/// the fresh ids, and references to groups the archive never defines are
/// dropped. Under `dry_run` nothing is written anywhere.
pub async fn import_archive(
    vault: &Vault,
    path: &Path,
    options: ImportOptions,
) -> Result<ImportReceipt> {
    let archive = read_archive(path)?;
    let (contacts, groups) = regenerate_ids(archive.snapshot.contacts, archive.snapshot.groups);

    let (current, _) = vault.dataset();
    let diff = DatasetDiff::compute(&current, &contacts).summary();
    let receipt = ImportReceipt {
        record_count: contacts.len(),
        group_count: groups.len(),
        dry_run: options.dry_run,
        safety_key: None,
        diff,
    };
    if options.dry_run {
        return Ok(receipt);
    }

    let safety_key = write_safety_snapshot(vault);
    vault.import_dataset(contacts, groups).await?;
    info!(
        path = %path.display(),
        records = receipt.record_count,
        groups = receipt.group_count,
        "archive imported"
    );
    Ok(ImportReceipt {
        safety_key,
        ..receipt
    })
}

/// Fresh ids for every record, memberships remapped along the way.
fn regenerate_ids(contacts: Vec<Contact>, groups: Vec<Group>) -> (Vec<Contact>, Vec<Group>) {
    let group_map: BTreeMap<GroupId, GroupId> = groups
        .iter()
        .map(|g| (g.id, GroupId::generate()))
        .collect();
    let groups = groups
        .into_iter()
        .map(|g| Group {
            id: group_map[&g.id],
            label: g.label,
        })
        .collect();
    let contacts = contacts
        .into_iter()
        .map(|mut c| {
            c.id = ContactId::generate();
            c.groups = c
                .groups
                .iter()
                .filter_map(|old| group_map.get(old).copied())
                .collect();
            c
        })
        .collect();
    (contacts, groups)
}

/// Park the pre-import dataset under the critical prefix, so the retention
/// sweep eventually prunes it and recovery scans can still find it.
fn write_safety_snapshot(vault: &Vault) -> Option<String> {
    let (contacts, groups) = vault.dataset();
    if contacts.is_empty() && groups.is_empty() {
        return None;
    }
    let now = now_ms();
    let key = format!("{CRITICAL_PREFIX}import_safety.{now}");
    let snapshot = Snapshot::capture(contacts, groups, now, Some(SnapshotKind::Critical), None)
        .for_location(&key);
    match serde_json::to_string(&snapshot) {
        Ok(payload) => match vault.kv.put(&key, &payload) {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(key = %key, error = %e, "safety snapshot write failed");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "safety snapshot serialize failed");
            None
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn iso_time(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map_or_else(|| "1970-01-01T00:00:00Z".to_string(), |dt| dt.to_rfc3339())
}
