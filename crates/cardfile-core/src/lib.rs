//! cardfile-core: local-first contact vault with redundant snapshots and
//! automatic recovery.
//!
//! # Architecture
//!
//! ```text
//! callers → Vault (roster + state machine)
//!              ↓
//!      KvStore / SqlStore  ← Scheduler (rapid / full / cleanup timers)
//!              ↓
//!      Integrity sweep → Recovery scoring → restore + re-persist
//! ```
//!
//! # Modules
//!
//! - `model`: contact and group records, field validation
//! - `roster`: authoritative in-memory dataset with dirty tracking
//! - `snapshot`: immutable dataset snapshots and the key namespace
//! - `kv_store`: synchronous bounded key-value backend
//! - `sql_store`: asynchronous indexed backend on SQLite
//! - `engine`: the `Vault` facade tying roster, stores, and recovery together
//! - `scheduler`: rapid/full/cleanup timers as cancellable tasks
//! - `integrity`: cross-store record count comparison
//! - `recovery`: candidate scoring and selection
//! - `events`: broadcast event stream for UI subscribers
//! - `diff`: dataset difference computation for sync payloads
//! - `search`: substring and fuzzy contact search
//! - `archive`: checksummed export/import archives
//! - `config`: TOML configuration with defaults
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod archive;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrity;
pub mod kv_store;
pub mod logging;
pub mod model;
pub mod recovery;
pub mod roster;
pub mod scheduler;
pub mod search;
pub mod snapshot;
pub mod sql_store;

pub use error::{Error, Result};

/// Crate version, stamped into archive manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
