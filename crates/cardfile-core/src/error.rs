//! Error types for cardfile-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cardfile-core
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected by field validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Recovery errors
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Archive export/import errors
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// No record with the given id
    #[error("Not found: {id}")]
    NotFound { id: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One rejected field with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldIssue {
    /// Field name as the caller supplied it (`name`, `email`, `phone`).
    pub field: String,
    /// What was wrong with the value.
    pub message: String,
}

/// Structured per-field validation failure.
///
/// Collects every rejected field in one pass so callers can render a
/// complete form-level report instead of fixing fields one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("{}", render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

fn render_issues(issues: &[FieldIssue]) -> String {
    let parts: Vec<String> = issues
        .iter()
        .map(|i| format!("{}: {}", i.field, i.message))
        .collect();
    parts.join("; ")
}

impl ValidationError {
    #[must_use]
    pub fn new(issues: Vec<FieldIssue>) -> Self {
        Self { issues }
    }

    /// Single-field constructor for call sites that only check one thing.
    #[must_use]
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![FieldIssue {
                field: field.into(),
                message: message.into(),
            }],
        }
    }
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The bounded synchronous store is over its byte quota
    #[error("quota exceeded: store limited to {limit_bytes} bytes")]
    QuotaExceeded { limit_bytes: u64 },

    /// A write landed on fewer redundant keys than required
    #[error("write failed for {key}: {detail}")]
    WriteFailed { key: String, detail: String },

    /// SQLite errors from the indexed store
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Background task for a blocking database call was cancelled
    #[error("database task cancelled: {0}")]
    TaskJoin(String),

    /// I/O errors from the file-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or unreadable persisted payload
    #[error("corrupt payload at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A field value is outside its allowed range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Recovery errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// No candidate dataset was readable from any source.
    ///
    /// The only condition in this subsystem that must surface to the user
    /// as a data-protection warning.
    #[error("no recoverable dataset found in any storage location")]
    Exhausted,

    /// Re-persisting the recovered dataset failed everywhere
    #[error("recovered dataset could not be re-persisted: {0}")]
    Repersist(String),
}

/// Archive export/import errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Archive checksum did not match its manifest
    #[error("checksum mismatch: manifest says {expected}, payload hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Archive written by a newer schema than this build understands
    #[error("archive schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    /// Archive file is not a valid export
    #[error("malformed archive: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_renders_all_fields() {
        let err = ValidationError::new(vec![
            FieldIssue {
                field: "name".to_string(),
                message: "must not be empty".to_string(),
            },
            FieldIssue {
                field: "phone".to_string(),
                message: "too short".to_string(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("name: must not be empty"));
        assert!(text.contains("phone: too short"));
    }

    #[test]
    fn store_error_wraps_into_top_level() {
        let err: Error = StoreError::QuotaExceeded { limit_bytes: 1024 }.into();
        assert!(matches!(
            err,
            Error::Store(StoreError::QuotaExceeded { limit_bytes: 1024 })
        ));
    }

    #[test]
    fn recovery_exhausted_message_is_user_readable() {
        let msg = RecoveryError::Exhausted.to_string();
        assert!(msg.contains("no recoverable dataset"));
    }

    #[test]
    fn single_issue_constructor() {
        let err = ValidationError::single("email", "missing @");
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].field, "email");
    }
}
