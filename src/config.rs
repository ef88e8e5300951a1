//! Runtime configuration.
//!
//! Every section has a `Default`. Values can be overridden from `PQSHARE_*`
//! environment variables or loaded from a JSON file.

use crate::crypto::password::KdfParams;
use crate::error::{Result, ShareError};
use crate::retry::RetryConfig;
use crate::store::DEFAULT_PAGE_SIZE;
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Environment variable for the data directory.
pub const ENV_DATA_DIR: &str = "PQSHARE_DATA_DIR";
const ENV_KDF_MEMORY_KIB: &str = "PQSHARE_KDF_MEMORY_KIB";
const ENV_KDF_ITERATIONS: &str = "PQSHARE_KDF_ITERATIONS";
const ENV_MIGRATION_PAGE_SIZE: &str = "PQSHARE_MIGRATION_PAGE_SIZE";
const ENV_MIGRATION_BATCH_SIZE: &str = "PQSHARE_MIGRATION_BATCH_SIZE";
const ENV_VERIFY_ATTEMPTS: &str = "PQSHARE_VERIFY_ATTEMPTS";
const ENV_VERIFY_BACKOFF_MS: &str = "PQSHARE_VERIFY_BACKOFF_MS";
const ENV_TX_RETRIES: &str = "PQSHARE_TX_RETRIES";

/// Sharing manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Attempts per atomic update before `ConcurrentModification` surfaces
    pub max_transaction_retries: u32,
    /// Page size for listing and bulk revocation queries
    pub page_size: usize,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: 5,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Key migration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Page size for the counting queries
    pub page_size: usize,
    /// Entities re-read and rewrapped per batch
    pub batch_size: usize,
    /// Attempts per entity write on version conflicts
    pub max_write_retries: u32,
    /// Backoff for verification re-reads and the profile round-trip
    pub verify: RetryConfig,
    /// Number of migrated entities re-read during verification (`None` = all)
    pub verify_sample: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: 100,
            max_write_retries: 5,
            verify: RetryConfig::default(),
            verify_sample: None,
        }
    }
}

/// RocksDB tuning for [`crate::store::RocksStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_open_files: i32,
    /// Memtable size in bytes before a flush
    pub write_buffer_size: usize,
    /// WAL size in bytes that forces a flush of every column family
    pub max_total_wal_size: u64,
    /// Background flush and compaction threads; 0 means one per CPU
    pub background_threads: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_open_files: 256,
            write_buffer_size: 16 << 20,
            max_total_wal_size: 64 << 20,
            background_threads: 0,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    pub kdf: KdfParams,
    pub sharing: SharingConfig,
    pub migration: MigrationConfig,
    pub storage: StorageConfig,
    /// Directory holding the RocksDB store
    pub data_dir: PathBuf,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            sharing: SharingConfig::default(),
            migration: MigrationConfig::default(),
            storage: StorageConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// `~/.pqshare`, or `./.pqshare` when no home directory is set
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pqshare")
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ShareError::config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ShareError::config(format!("{} is not valid unicode", name)))
        }
    }
}

impl ShareConfig {
    /// Defaults overridden by `PQSHARE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file; missing sections keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(memory) = env_parse(ENV_KDF_MEMORY_KIB)? {
            self.kdf.memory_kib = memory;
        }
        if let Some(iterations) = env_parse(ENV_KDF_ITERATIONS)? {
            self.kdf.iterations = iterations;
        }
        if let Some(page_size) = env_parse(ENV_MIGRATION_PAGE_SIZE)? {
            self.migration.page_size = page_size;
        }
        if let Some(batch_size) = env_parse(ENV_MIGRATION_BATCH_SIZE)? {
            self.migration.batch_size = batch_size;
        }
        if let Some(attempts) = env_parse(ENV_VERIFY_ATTEMPTS)? {
            self.migration.verify.max_attempts = attempts;
        }
        if let Some(backoff) = env_parse(ENV_VERIFY_BACKOFF_MS)? {
            self.migration.verify.initial_delay_ms = backoff;
        }
        if let Some(retries) = env_parse(ENV_TX_RETRIES)? {
            self.sharing.max_transaction_retries = retries;
        }
        Ok(())
    }

    /// Rejects settings no operation could run with
    pub fn validate(&self) -> Result<()> {
        self.kdf.to_argon2()?;
        Validator::validate_page_size(self.sharing.page_size)
            .map_err(|e| ShareError::config(format!("sharing.page_size: {}", e)))?;
        Validator::validate_page_size(self.migration.page_size)
            .map_err(|e| ShareError::config(format!("migration.page_size: {}", e)))?;
        if self.migration.batch_size == 0 {
            return Err(ShareError::config("migration.batch_size must be at least 1"));
        }
        if self.sharing.max_transaction_retries == 0 {
            return Err(ShareError::config(
                "sharing.max_transaction_retries must be at least 1",
            ));
        }
        if self.migration.max_write_retries == 0 {
            return Err(ShareError::config("migration.max_write_retries must be at least 1"));
        }
        if self.storage.max_open_files == 0 {
            return Err(ShareError::config("storage.max_open_files must be positive or -1"));
        }
        if self.migration.verify_sample == Some(0) {
            return Err(ShareError::config("migration.verify_sample must be at least 1"));
        }
        self.migration.verify.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShareConfig::default();
        config.validate().unwrap();
        assert_eq!(config.migration.page_size, 1000);
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ShareConfig::default();
        config.migration.batch_size = 0;
        assert!(matches!(config.validate(), Err(ShareError::Config(_))));

        let mut config = ShareConfig::default();
        config.migration.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = ShareConfig::default();
        config.migration.verify.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ShareConfig::default();
        config.kdf.iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pqshare.json");
        std::fs::write(
            &path,
            r#"{"migration": {"batch_size": 7}, "sharing": {"max_transaction_retries": 9}}"#,
        )
        .unwrap();

        let config = ShareConfig::load(&path).unwrap();
        assert_eq!(config.migration.batch_size, 7);
        assert_eq!(config.sharing.max_transaction_retries, 9);
        assert_eq!(config.migration.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ShareConfig::load(&path),
            Err(ShareError::Serialization(_))
        ));
    }
}
