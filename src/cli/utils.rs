//! Utility functions for CLI operations.

use crate::config::ShareConfig;
use crate::crypto::password::Passphrase;
use crate::error::{Result, ShareError};
use crate::migration::KeyMigrationService;
use crate::revocation::AccessRevocationService;
use crate::sharing::SharingManager;
use crate::store::RocksStore;
use rpassword::prompt_password;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Services wired over the on-disk store
pub struct Session {
    pub config: ShareConfig,
    pub store: Arc<RocksStore>,
    pub sharing: Arc<SharingManager>,
}

impl Session {
    pub fn migration(&self) -> KeyMigrationService {
        KeyMigrationService::with_store(self.store.clone(), self.config.migration.clone())
    }

    pub fn revocation(&self) -> AccessRevocationService {
        AccessRevocationService::new(self.sharing.clone())
    }
}

/// Loads configuration from the environment and opens the store
pub fn open_session() -> Result<Session> {
    let config = ShareConfig::from_env()?;
    if !config.data_dir.exists() {
        fs::create_dir_all(&config.data_dir)?;
    }

    let store = Arc::new(RocksStore::open(&config.data_dir, &config.storage)?);
    let sharing = Arc::new(SharingManager::with_store(
        store.clone(),
        config.sharing.clone(),
    ));
    debug!(data_dir = %config.data_dir.display(), "Opened session");

    Ok(Session {
        config,
        store,
        sharing,
    })
}

/// Read file contents
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Write file contents
pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    Ok(())
}

/// Format a millisecond timestamp for display
pub fn format_timestamp(timestamp_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

/// Prompt for a passphrase securely (no echo to terminal)
pub fn prompt_for_passphrase(prompt: &str) -> Result<Passphrase> {
    let passphrase = prompt_password(format!("{}: ", prompt))
        .map_err(|e| ShareError::validation(format!("Failed to read passphrase: {}", e)))?;

    if passphrase.is_empty() {
        return Err(ShareError::InvalidPassphrase);
    }

    Ok(Passphrase::new(passphrase))
}

/// Prompt twice and require both entries to match
pub fn prompt_for_new_passphrase(prompt: &str) -> Result<Passphrase> {
    let first = prompt_password(format!("{}: ", prompt))
        .map_err(|e| ShareError::validation(format!("Failed to read passphrase: {}", e)))?;
    let second = prompt_password("Repeat passphrase: ")
        .map_err(|e| ShareError::validation(format!("Failed to read passphrase: {}", e)))?;

    if first.is_empty() {
        return Err(ShareError::InvalidPassphrase);
    }
    if first != second {
        return Err(ShareError::validation("Passphrases do not match"));
    }

    Ok(Passphrase::new(first))
}
