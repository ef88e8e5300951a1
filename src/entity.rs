//! The shared file/folder record.

use crate::crypto::envelope::WrappedKey;
use crate::error::{Result, ShareError};
use crate::metadata::FieldValue;
use crate::types::{EntityId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Whether a record describes a file or a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    File,
    Folder,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::File => f.write_str("file"),
            EntityKind::Folder => f.write_str("folder"),
        }
    }
}

/// A file or folder record as persisted in the document store
///
/// The store only ever sees ciphertext: content lives encrypted at
/// `storage_path`, metadata is sealed inline and the content key exists only
/// as one wrapped copy per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub owner: UserId,
    pub name: FieldValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    pub encrypted_keys: BTreeMap<UserId, WrappedKey>,
    pub shared_with: BTreeSet<UserId>,
    #[serde(default)]
    pub parent: Option<EntityId>,
    /// Optimistic-concurrency counter, maintained by the document store
    #[serde(default)]
    pub version: u64,
    /// Server-assigned timestamp (ms) of the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl EncryptedEntity {
    /// Creates a record readable only by its owner
    pub fn new(
        id: EntityId,
        kind: EntityKind,
        owner: UserId,
        owner_key: WrappedKey,
        name: FieldValue,
    ) -> Self {
        let mut encrypted_keys = BTreeMap::new();
        encrypted_keys.insert(owner.clone(), owner_key);
        let mut shared_with = BTreeSet::new();
        shared_with.insert(owner.clone());

        Self {
            id,
            kind,
            owner,
            name,
            size: None,
            storage_path: None,
            encrypted_keys,
            shared_with,
            parent: None,
            version: 0,
            updated_at: None,
        }
    }

    pub fn with_size(mut self, size: FieldValue) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<EntityId>) -> Self {
        self.parent = parent;
        self
    }

    /// Returns the wrapped key for `uid`, or `NoWrappedKey`
    pub fn wrapped_key_for(&self, uid: &UserId) -> Result<&WrappedKey> {
        self.encrypted_keys
            .get(uid)
            .ok_or_else(|| ShareError::no_wrapped_key(&self.id, uid))
    }

    pub fn has_access(&self, uid: &UserId) -> bool {
        self.encrypted_keys.contains_key(uid)
    }

    pub fn is_owner(&self, uid: &UserId) -> bool {
        &self.owner == uid
    }

    /// Sets the wrapped key for `uid` and adds it to the recipient set
    pub fn set_wrapped_key(&mut self, uid: UserId, wrapped: WrappedKey) {
        self.shared_with.insert(uid.clone());
        self.encrypted_keys.insert(uid, wrapped);
    }

    /// Removes `uid` from the recipient set
    ///
    /// The owner cannot be removed. Returns whether anything changed.
    pub fn remove_recipient(&mut self, uid: &UserId) -> Result<bool> {
        if self.is_owner(uid) {
            return Err(ShareError::permission_denied(format!(
                "cannot revoke the owner of entity {}",
                self.id
            )));
        }
        let had_key = self.encrypted_keys.remove(uid).is_some();
        let was_shared = self.shared_with.remove(uid);
        Ok(had_key || was_shared)
    }

    /// Checks the recipient-set invariants
    pub fn check_invariants(&self) -> Result<()> {
        if self.encrypted_keys.is_empty() {
            return Err(ShareError::EmptyRecipientSet);
        }

        if !self.shared_with.contains(&self.owner) {
            return Err(ShareError::invariant(format!(
                "owner {} missing from sharedWith of {}",
                self.owner, self.id
            )));
        }

        if !self.encrypted_keys.keys().eq(self.shared_with.iter()) {
            return Err(ShareError::invariant(format!(
                "encryptedKeys and sharedWith diverge on {}",
                self.id
            )));
        }

        Ok(())
    }
}
