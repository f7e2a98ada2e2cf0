//! Dataset difference computation.
//!
//! Compares two contact sets by id and content hash into added, modified,
//! and deleted buckets. The hash covers the user-visible fields only, so
//! two records that differ just in timestamps compare equal. The summary
//! form rides along with remote sync payloads and the status view; the
//! resolve helper picks a winner for a conflicting id by last write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{Contact, ContactId};

/// Hex SHA-256 over the identity-independent fields of a contact.
#[must_use]
pub fn content_hash(contact: &Contact) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contact.name.as_bytes());
    hasher.update([0]);
    hasher.update(contact.email.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(contact.phone.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update([u8::from(contact.favorite), u8::from(contact.blocked)]);
    for group in &contact.groups {
        hasher.update(group.0.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Ids of records that differ between two datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDiff {
    /// Present in `other`, absent locally.
    pub added: Vec<ContactId>,
    /// Present on both sides with different content.
    pub modified: Vec<ContactId>,
    /// Present locally, absent in `other`.
    pub deleted: Vec<ContactId>,
}

/// Count-only view of a diff, small enough for a sync payload or log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl DatasetDiff {
    /// Diff `local` against `other`, id by id.
    #[must_use]
    pub fn compute(local: &[Contact], other: &[Contact]) -> Self {
        let local_hashes: BTreeMap<ContactId, String> =
            local.iter().map(|c| (c.id, content_hash(c))).collect();
        let other_hashes: BTreeMap<ContactId, String> =
            other.iter().map(|c| (c.id, content_hash(c))).collect();

        let mut diff = Self::default();
        for (id, hash) in &other_hashes {
            match local_hashes.get(id) {
                None => diff.added.push(*id),
                Some(local_hash) if local_hash != hash => diff.modified.push(*id),
                Some(_) => {}
            }
        }
        for id in local_hashes.keys() {
            if !other_hashes.contains_key(id) {
                diff.deleted.push(*id);
            }
        }
        diff
    }

    #[must_use]
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Last-write-wins pick between two versions of the same record.
///
/// Equal timestamps keep the local version; recovery and import paths
/// must stay deterministic when clocks collide.
#[must_use]
pub fn resolve(local: Contact, other: Contact) -> Contact {
    debug_assert_eq!(local.id, other.id);
    if other.updated_at_ms > local.updated_at_ms {
        other
    } else {
        local
    }
}
