//! Shared identifier and report types.

use crate::error::{Result, ShareError};
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a user (the key of `encryptedKeys` and members of `sharedWith`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a validated user ID.
    pub fn new(uid: impl Into<String>) -> Result<Self> {
        let uid = uid.into();
        Validator::validate_user_id(&uid)?;
        Ok(Self(uid))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier of a file or folder record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates a validated entity ID.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Validator::validate_entity_id(&id)?;
        Ok(Self(id))
    }

    /// Generates a fresh random entity ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Outcome of a best-effort batch operation.
///
/// Per-item failures are collected instead of aborting the batch.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Items that were processed successfully
    pub succeeded: Vec<T>,
    /// Items that failed, with the error that stopped them
    pub failed: Vec<(T, ShareError)>,
}

impl<T> BatchReport<T> {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Records a success.
    pub fn record_success(&mut self, item: T) {
        self.succeeded.push(item);
    }

    /// Records a failure.
    pub fn record_failure(&mut self, item: T, error: ShareError) {
        self.failed.push((item, error));
    }

    /// Returns true when no item failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the failed items without their errors.
    pub fn failed_items(&self) -> Vec<&T> {
        self.failed.iter().map(|(item, _)| item).collect()
    }

    /// Total number of items processed.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_validation() {
        assert!(UserId::new("alice").is_ok());
        assert!(UserId::new("").is_err());
        assert!(UserId::new("a:b").is_err());
        assert!("bob".parse::<UserId>().is_ok());
    }

    #[test]
    fn test_entity_id_generation_is_unique() {
        let a = EntityId::generate();
        let b = EntityId::generate();
        assert_ne!(a, b);
        assert!(EntityId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let uid = UserId::new("alice").unwrap();
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"alice\"");
    }

    #[test]
    fn test_batch_report() {
        let mut report = BatchReport::new();
        report.record_success("a");
        report.record_failure("b", ShareError::DecryptionFailed);
        assert!(!report.is_complete());
        assert_eq!(report.total(), 2);
        assert_eq!(report.failed_items(), vec![&"b"]);
    }
}
