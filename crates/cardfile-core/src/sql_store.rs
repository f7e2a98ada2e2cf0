//! Asynchronous structured backend on SQLite.
//!
//! The large store: snapshots live in a `snapshots` table with indexed
//! `kind` and `captured_at` columns plus a denormalized `record_count`, so
//! integrity checks and retention sweeps read column summaries without
//! parsing payloads. All public methods are async; the blocking rusqlite
//! calls run on the blocking pool. Writes go through `INSERT OR REPLACE`
//! and are idempotent.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::snapshot::{Snapshot, SnapshotKind};

/// Column-only view of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSummary {
    pub key: String,
    pub kind: Option<SnapshotKind>,
    pub captured_at_ms: i64,
    pub record_count: usize,
}

/// SQLite-backed snapshot store.
///
/// Holds only the database path; every operation opens its own connection
/// (snapshot traffic is low and WAL keeps readers and the writer apart).
#[derive(Debug, Clone)]
pub struct SqlStore {
    db_path: Arc<String>,
}

impl SqlStore {
    /// Open the database and make sure the schema exists.
    ///
    /// Performs blocking I/O; call during startup, not from a hot async path.
    pub fn open(db_path: impl Into<String>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_conn(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key          TEXT PRIMARY KEY,
                kind         TEXT,
                captured_at  INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                payload      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_kind ON snapshots(kind);
            CREATE INDEX IF NOT EXISTS idx_snapshots_captured_at ON snapshots(captured_at);",
        )?;
        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    /// Store one snapshot under `key`, replacing any previous value.
    pub async fn put(&self, key: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;
        let kind = snapshot.kind.map(kind_column);
        let captured_at = snapshot.captured_at_ms;
        let record_count = snapshot.record_count() as i64;
        let db_path = Arc::clone(&self.db_path);
        let key = key.to_string();

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            conn.execute(
                "INSERT OR REPLACE INTO snapshots (key, kind, captured_at, record_count, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![key, kind, captured_at, record_count, payload],
            )?;
            Ok(())
        })
        .await
    }

    /// Load one snapshot. `Ok(None)` means the key is absent; a present but
    /// unparseable payload is a `Corrupt` error so callers can choose to
    /// treat it as absent.
    pub async fn get(&self, key: &str) -> Result<Option<Snapshot>, StoreError> {
        let db_path = Arc::clone(&self.db_path);
        let lookup = key.to_string();

        let payload: Option<String> = run_blocking(move || {
            let conn = open_conn(&db_path)?;
            let mut stmt = conn.prepare("SELECT payload FROM snapshots WHERE key = ?1")?;
            let mut rows = stmt.query([lookup.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
        .await?;

        match payload {
            Some(text) => match serde_json::from_str(&text) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => Err(StoreError::Corrupt {
                    key: key.to_string(),
                    source: e,
                }),
            },
            None => Ok(None),
        }
    }

    /// Remove one key. Absent keys are a no-op.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let db_path = Arc::clone(&self.db_path);
        let key = key.to_string();

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            conn.execute("DELETE FROM snapshots WHERE key = ?1", [key.as_str()])?;
            Ok(())
        })
        .await
    }

    /// All keys under a namespace prefix, in key order.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let db_path = Arc::clone(&self.db_path);
        let pattern = like_prefix(prefix);

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT key FROM snapshots WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
            let keys = stmt
                .query_map([pattern.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    /// Column summary of the most recently captured snapshot, if any.
    pub async fn newest_summary(&self) -> Result<Option<StoredSummary>, StoreError> {
        let db_path = Arc::clone(&self.db_path);

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT key, kind, captured_at, record_count FROM snapshots
                 ORDER BY captured_at DESC, key DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => {
                    let kind: Option<String> = row.get(1)?;
                    Ok(Some(StoredSummary {
                        key: row.get(0)?,
                        kind: kind.as_deref().and_then(kind_from_column),
                        captured_at_ms: row.get(2)?,
                        record_count: row.get::<_, i64>(3)?.max(0) as usize,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Keys of snapshots whose embedded capture time predates `cutoff_ms`.
    pub async fn keys_captured_before(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError> {
        let db_path = Arc::clone(&self.db_path);

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT key FROM snapshots WHERE captured_at < ?1 ORDER BY key")?;
            let keys = stmt
                .query_map([cutoff_ms], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let db_path = Arc::clone(&self.db_path);

        run_blocking(move || {
            let conn = open_conn(&db_path)?;
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, rusqlite::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
        .map_err(StoreError::Db)
}

fn open_conn(db_path: &str) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn kind_column(kind: SnapshotKind) -> &'static str {
    match kind {
        SnapshotKind::Rapid => "rapid",
        SnapshotKind::Full => "full",
        SnapshotKind::Critical => "critical",
    }
}

fn kind_from_column(s: &str) -> Option<SnapshotKind> {
    match s {
        "rapid" => Some(SnapshotKind::Rapid),
        "full" => Some(SnapshotKind::Full),
        "critical" => Some(SnapshotKind::Critical),
        _ => None,
    }
}

fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
