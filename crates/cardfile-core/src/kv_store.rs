//! Synchronous bounded key-value backend.
//!
//! The fast store: a quota-bounded map persisted as a single JSON document,
//! rewritten atomically (temp file + rename) on every change. Every method
//! is synchronous so teardown paths can use it without an executor. Puts of
//! identical content are no-ops, so redundant timer writes never touch disk
//! twice.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Default quota roughly matching the small-store class this backend models.
pub const DEFAULT_QUOTA_BYTES: u64 = 5_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// Path of the JSON document backing the store.
    pub path: PathBuf,
    /// Hard ceiling on the sum of key and value bytes.
    pub quota_bytes: u64,
}

impl KvStoreConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }

    #[must_use]
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvDocument {
    entries: BTreeMap<String, String>,
}

#[derive(Debug)]
struct KvInner {
    entries: BTreeMap<String, String>,
    payload_bytes: u64,
}

/// Quota-bounded synchronous store.
#[derive(Debug)]
pub struct KvStore {
    config: KvStoreConfig,
    inner: Mutex<KvInner>,
}

impl KvStore {
    /// Open or create the backing document.
    ///
    /// An unreadable document is moved aside to `<path>.corrupt` and the
    /// store starts empty; the damaged bytes stay on disk for inspection
    /// instead of being overwritten.
    pub fn open(config: KvStoreConfig) -> Result<Self, StoreError> {
        ensure_parent_dir(&config.path)?;

        let entries = match fs::read_to_string(&config.path) {
            Ok(text) => match serde_json::from_str::<KvDocument>(&text) {
                Ok(doc) => doc.entries,
                Err(e) => {
                    let aside = corrupt_path(&config.path);
                    warn!(
                        path = %config.path.display(),
                        aside = %aside.display(),
                        error = %e,
                        "kv document unreadable; moving aside and starting empty"
                    );
                    if let Err(rename_err) = fs::rename(&config.path, &aside) {
                        warn!(error = %rename_err, "failed to move corrupt kv document aside");
                    }
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let payload_bytes = payload_size(&entries);
        Ok(Self {
            config,
            inner: Mutex::new(KvInner {
                entries,
                payload_bytes,
            }),
        })
    }

    /// Read one value. Absence and read problems both come back as `None`;
    /// this store is a replica, not an authority.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Write one value, enforcing the quota.
    ///
    /// Identical content is a no-op from both the reader's and the disk's
    /// perspective.
    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        if inner.entries.get(key).is_some_and(|v| v == value) {
            debug!(key, "kv put skipped: content unchanged");
            return Ok(());
        }

        let old_entry = inner
            .entries
            .get(key)
            .map_or(0, |v| (key.len() + v.len()) as u64);
        let new_total =
            inner.payload_bytes.saturating_sub(old_entry) + (key.len() + value.len()) as u64;
        if new_total > self.config.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                limit_bytes: self.config.quota_bytes,
            });
        }

        let mut candidate = inner.entries.clone();
        candidate.insert(key.to_string(), value.to_string());
        self.persist(&candidate)?;

        inner.entries = candidate;
        inner.payload_bytes = new_total;
        Ok(())
    }

    /// Remove one key. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) {
            return Ok(());
        }

        let mut candidate = inner.entries.clone();
        candidate.remove(key);
        self.persist(&candidate)?;

        inner.payload_bytes = payload_size(&candidate);
        inner.entries = candidate;
        Ok(())
    }

    /// All keys under a namespace prefix, in key order.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Current logical payload size in bytes.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.inner.lock().payload_bytes
    }

    #[must_use]
    pub fn quota_bytes(&self) -> u64 {
        self.config.quota_bytes
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let doc = KvDocument {
            entries: entries.clone(),
        };
        let json = serde_json::to_string(&doc)?;
        let tmp = self.config.path.with_extension("tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.config.path)?;
        Ok(())
    }
}

fn payload_size(entries: &BTreeMap<String, String>) -> u64 {
    entries
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum()
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".corrupt");
    PathBuf::from(name)
}

fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
