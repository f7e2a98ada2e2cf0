//! Vault configuration: a TOML file with every field defaulted.
//!
//! Sections map one-to-one onto the subsystems that consume them; each
//! sub-config lives next to its subsystem and is re-validated here as a
//! whole before the engine opens anything.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::integrity::IntegrityConfig;
use crate::kv_store::DEFAULT_QUOTA_BYTES;
use crate::logging::LogConfig;
use crate::recovery::ScoringWeights;
use crate::scheduler::SchedulerConfig;

/// Smallest quota the bounded store may be given. Below this even a
/// modest dataset cannot keep two mirrors.
pub const MIN_KV_QUOTA_BYTES: u64 = 16 * 1024;

/// Where the two backing files live and how big the bounded store may
/// grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding both store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File name of the bounded key-value document.
    #[serde(default = "default_kv_file")]
    pub kv_file: String,
    /// File name of the structured snapshot database.
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// Capacity bound of the key-value document.
    #[serde(default = "default_kv_quota_bytes")]
    pub kv_quota_bytes: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from(".cardfile"), |dir| dir.join("cardfile"))
}

fn default_kv_file() -> String {
    "vault.json".to_string()
}

fn default_db_file() -> String {
    "vault.db".to_string()
}

fn default_kv_quota_bytes() -> u64 {
    DEFAULT_QUOTA_BYTES
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            kv_file: default_kv_file(),
            db_file: default_db_file(),
            kv_quota_bytes: default_kv_quota_bytes(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join(&self.kv_file)
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kv_file.is_empty() || self.db_file.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.kv_file and storage.db_file must not be empty".to_string(),
            ));
        }
        if self.kv_file == self.db_file {
            return Err(ConfigError::Invalid(
                "storage.kv_file and storage.db_file must differ".to_string(),
            ));
        }
        if self.kv_quota_bytes < MIN_KV_QUOTA_BYTES {
            return Err(ConfigError::Invalid(format!(
                "storage.kv_quota_bytes must be at least {MIN_KV_QUOTA_BYTES}, got {}",
                self.kv_quota_bytes
            )));
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub integrity: IntegrityConfig,
    pub scoring: ScoringWeights,
    pub log: LogConfig,
}

impl VaultConfig {
    /// Defaults with both store files placed under `dir`.
    #[must_use]
    pub fn for_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: expand_tilde_path(dir.into()),
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    /// Conventional config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("cardfile.toml"),
            |dir| dir.join("cardfile").join("config.toml"),
        )
    }

    /// Parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.storage.data_dir = expand_tilde_path(config.storage.data_dir);
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load an explicit path, or the conventional one when it exists, or
    /// plain defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let conventional = Self::default_path();
                if conventional.is_file() {
                    Self::load(&conventional)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.scheduler.validate()?;
        self.integrity.validate()?;
        self.scoring.validate()?;
        self.log.validate()?;
        Ok(())
    }
}

fn expand_tilde_path(path: PathBuf) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path;
    };
    if text == "~" {
        return dirs::home_dir().unwrap_or(path);
    }
    if let Some(suffix) = text.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    path
}
