//! Sharing manager: entity lifecycle, grants and revocations.
//!
//! Every record mutation is a read-mutate-compare-and-swap against the
//! document store (see [`update_entity`]). Granting never touches the content
//! ciphertext: the granter's wrapped key is opened, the content key is wrapped
//! for the new recipient and only `encryptedKeys`/`sharedWith` change.
//! Revocation is access-list removal; [`SharingManager::rotate_content_key`]
//! is the opt-in path that also invalidates keys a revoked user may have
//! cached.

use crate::config::SharingConfig;
use crate::crypto::envelope::{
    decrypt_with_content_key, encrypt_with_content_key, unwrap_content_key, wrap_content_key,
    WrappedKey,
};
use crate::crypto::keys::{KeyPair, PrivateKey, PublicKey};
use crate::crypto::password::{unwrap_private_key, wrap_private_key, KdfParams, Passphrase};
use crate::crypto::symmetric::ContentKey;
use crate::entity::{EncryptedEntity, EntityKind};
use crate::error::{Result, ShareError};
use crate::metadata::{
    decrypt_metadata_with_key, encrypt_metadata, upgrade_legacy_metadata, Metadata,
};
use crate::store::{
    query_all, update_entity, BlobStore, DocumentStore, EntityFilter, InteractionLog,
    ProfileStore,
};
use crate::types::{BatchReport, EntityId, UserId};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Input for [`SharingManager::create_entity`]
#[derive(Debug, Clone)]
pub struct NewEntity<'a> {
    pub owner: &'a UserId,
    /// Public key the owner's wrapped key is created for
    pub owner_key: &'a PublicKey,
    pub kind: EntityKind,
    pub name: &'a str,
    /// File content; must be empty for folders
    pub content: &'a [u8],
    pub parent: Option<EntityId>,
}

impl<'a> NewEntity<'a> {
    pub fn file(owner: &'a UserId, owner_key: &'a PublicKey, name: &'a str, content: &'a [u8]) -> Self {
        Self {
            owner,
            owner_key,
            kind: EntityKind::File,
            name,
            content,
            parent: None,
        }
    }

    pub fn folder(owner: &'a UserId, owner_key: &'a PublicKey, name: &'a str) -> Self {
        Self {
            owner,
            owner_key,
            kind: EntityKind::Folder,
            name,
            content: &[],
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Coordinates the stores and the envelope engine for one deployment
pub struct SharingManager {
    blobs: Arc<dyn BlobStore>,
    docs: Arc<dyn DocumentStore>,
    profiles: Arc<dyn ProfileStore>,
    interactions: Arc<dyn InteractionLog>,
    config: SharingConfig,
}

impl SharingManager {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        docs: Arc<dyn DocumentStore>,
        profiles: Arc<dyn ProfileStore>,
        interactions: Arc<dyn InteractionLog>,
        config: SharingConfig,
    ) -> Self {
        Self {
            blobs,
            docs,
            profiles,
            interactions,
            config,
        }
    }

    /// Builds a manager over one store implementing every collaborator trait
    pub fn with_store<S>(store: Arc<S>, config: SharingConfig) -> Self
    where
        S: BlobStore + DocumentStore + ProfileStore + InteractionLog + 'static,
    {
        Self::new(store.clone(), store.clone(), store.clone(), store, config)
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    // =========================================================================
    // Key pairs
    // =========================================================================

    /// Generates a key pair for `uid` and publishes it to the profile store
    ///
    /// Refuses to overwrite an existing key; rotation goes through
    /// [`crate::migration::KeyMigrationService`] so existing wrapped keys are
    /// rewrapped first.
    pub fn enroll_user(&self, uid: &UserId, passphrase: &Passphrase, kdf: &KdfParams) -> Result<KeyPair> {
        if self.profiles.get_public_key(uid)?.is_some() {
            return Err(ShareError::validation(format!(
                "user {} already has a published key; migrate instead",
                uid
            )));
        }

        let key_pair = KeyPair::generate()?;
        let wrapped = wrap_private_key(key_pair.private_key(), passphrase, kdf)?;
        self.profiles
            .publish_key_pair(uid, key_pair.public_key(), &wrapped)?;

        info!(uid = %uid, fingerprint = %key_pair.public_key().fingerprint_hex(), "Enrolled user key pair");
        Ok(key_pair)
    }

    /// Opens the user's published passphrase-wrapped private key
    pub fn unlock_private_key(&self, uid: &UserId, passphrase: &Passphrase) -> Result<PrivateKey> {
        let wrapped = self
            .profiles
            .get_wrapped_private_key(uid)?
            .ok_or_else(|| ShareError::not_found(format!("wrapped private key for {}", uid)))?;
        unwrap_private_key(&wrapped, passphrase)
    }

    /// Published public key, or `MissingPublicKey`
    pub fn public_key_for(&self, uid: &UserId) -> Result<PublicKey> {
        self.profiles
            .get_public_key(uid)?
            .ok_or_else(|| ShareError::missing_public_key(uid))
    }

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Encrypts content and metadata for the owner and inserts the record
    ///
    /// The blob is written first under a fresh storage path; if the record
    /// insert fails the blob is removed again.
    pub fn create_entity(&self, request: NewEntity<'_>) -> Result<EncryptedEntity> {
        if request.kind == EntityKind::Folder && !request.content.is_empty() {
            return Err(ShareError::validation("folders carry no content"));
        }
        if let Some(parent_id) = &request.parent {
            let parent = self.load(parent_id)?;
            if parent.kind != EntityKind::Folder {
                return Err(ShareError::validation(format!("parent {} is not a folder", parent_id)));
            }
            if !parent.has_access(request.owner) {
                return Err(ShareError::permission_denied(format!(
                    "{} has no access to folder {}",
                    request.owner, parent_id
                )));
            }
        }

        let mut rng = OsRng;
        let id = EntityId::generate();
        let content_key = ContentKey::generate(&mut rng)?;
        let owner_wrapped = wrap_content_key(&content_key, request.owner_key, &mut rng)?;

        let size = match request.kind {
            EntityKind::File => Some(request.content.len() as u64),
            EntityKind::Folder => None,
        };
        let (name, size) = encrypt_metadata(&Metadata::new(request.name, size), &content_key, &mut rng)?;

        let mut entity = EncryptedEntity::new(
            id.clone(),
            request.kind,
            request.owner.clone(),
            owner_wrapped,
            name,
        )
        .with_parent(request.parent.clone());
        entity.size = size;

        if request.kind == EntityKind::File {
            let ciphertext = encrypt_with_content_key(request.content, &content_key, &mut rng)?;
            let path = blob_path(&id);
            self.blobs.put(&path, &ciphertext)?;
            entity = entity.with_storage_path(path);
        }
        entity.check_invariants()?;

        match self.docs.insert(&entity) {
            Ok(stored) => {
                info!(
                    entity_id = %stored.id,
                    owner = %stored.owner,
                    kind = %stored.kind,
                    "Created entity"
                );
                Ok(stored)
            }
            Err(e) => {
                if let Some(path) = &entity.storage_path {
                    self.discard_blob(path);
                }
                Err(e)
            }
        }
    }

    /// Deletes the record and its blob; owner only
    pub fn delete_entity(&self, id: &EntityId, caller: &UserId) -> Result<()> {
        let attempts = self.config.max_transaction_retries.max(1);
        for attempt in 1..=attempts {
            let current = self.load(id)?;
            if !current.is_owner(caller) {
                return Err(ShareError::permission_denied(format!(
                    "only the owner may delete entity {}",
                    id
                )));
            }

            match self.docs.delete(id, current.version) {
                Ok(()) => {
                    // The record is gone; a leftover blob is unreachable
                    if let Some(path) = &current.storage_path {
                        self.discard_blob(path);
                    }
                    info!(entity_id = %id, owner = %caller, "Deleted entity");
                    return Ok(());
                }
                Err(ShareError::ConcurrentModification { .. }) if attempt < attempts => {
                    debug!(entity_id = %id, attempt, "Version conflict on delete, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ShareError::concurrent_modification(id))
    }

    // =========================================================================
    // Grants and revocations
    // =========================================================================

    /// Gives `recipient` access to the entity
    ///
    /// The granter must currently hold a wrapped key. The recipient's
    /// published public key is looked up first; without one the grant fails
    /// with `MissingPublicKey`. Granting to a current recipient is a no-op.
    pub fn grant_access(
        &self,
        id: &EntityId,
        granter: &UserId,
        granter_key: &PrivateKey,
        recipient: &UserId,
    ) -> Result<EncryptedEntity> {
        let public_key = self.public_key_for(recipient)?;
        let recipients = vec![(recipient.clone(), public_key)];
        let stored = self.apply_grants(id, granter, granter_key, &recipients)?;

        self.touch_interaction(granter, recipient);
        info!(entity_id = %id, granter = %granter, recipient = %recipient, "Granted access");
        Ok(stored)
    }

    /// Grants access to several users in one atomic update
    ///
    /// Recipients without a published key are skipped and reported; the rest
    /// are granted together. If the update itself fails every remaining
    /// recipient is reported with that error.
    pub fn grant_access_batch(
        &self,
        id: &EntityId,
        granter: &UserId,
        granter_key: &PrivateKey,
        recipients: &[UserId],
    ) -> BatchReport<UserId> {
        let mut report = BatchReport::new();
        let mut resolved = Vec::with_capacity(recipients.len());

        for uid in recipients {
            match self.public_key_for(uid) {
                Ok(public_key) => resolved.push((uid.clone(), public_key)),
                Err(e) => {
                    debug!(entity_id = %id, uid = %uid, error = %e, "Skipping recipient");
                    report.record_failure(uid.clone(), e);
                }
            }
        }

        if resolved.is_empty() {
            return report;
        }

        match self.apply_grants(id, granter, granter_key, &resolved) {
            Ok(_) => {
                for (uid, _) in resolved {
                    self.touch_interaction(granter, &uid);
                    report.record_success(uid);
                }
            }
            Err(e) => {
                let message = e.to_string();
                let mut first = Some(e);
                for (uid, _) in resolved {
                    // Every recipient gets the same failure; only the first keeps the original
                    let err = first
                        .take()
                        .unwrap_or_else(|| ShareError::storage(message.clone()));
                    report.record_failure(uid, err);
                }
            }
        }

        info!(
            entity_id = %id,
            granter = %granter,
            granted = report.succeeded.len(),
            failed = report.failed.len(),
            "Batch grant finished"
        );
        report
    }

    fn apply_grants(
        &self,
        id: &EntityId,
        granter: &UserId,
        granter_key: &PrivateKey,
        recipients: &[(UserId, PublicKey)],
    ) -> Result<EncryptedEntity> {
        let mut rng = OsRng;
        // Wraps are computed once per distinct granter key and reused across
        // CAS retries; a rotated content key invalidates them.
        let mut prepared: Option<(WrappedKey, Vec<(UserId, WrappedKey)>)> = None;

        update_entity(
            self.docs.as_ref(),
            id,
            self.config.max_transaction_retries,
            |entity| {
                let source = entity.wrapped_key_for(granter)?.clone();
                if recipients.iter().all(|(uid, _)| entity.has_access(uid)) {
                    return Ok(false);
                }

                let stale = prepared.as_ref().map_or(true, |(used, _)| used != &source);
                if stale {
                    let content_key = unwrap_content_key(&source, granter_key)?;
                    let wraps = recipients
                        .iter()
                        .map(|(uid, public_key)| {
                            Ok((uid.clone(), wrap_content_key(&content_key, public_key, &mut rng)?))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    prepared = Some((source, wraps));
                }

                if let Some((_, wraps)) = &prepared {
                    for (uid, wrapped) in wraps {
                        if !entity.has_access(uid) {
                            entity.set_wrapped_key(uid.clone(), wrapped.clone());
                        }
                    }
                }
                Ok(true)
            },
        )
    }

    /// Removes `uid` from the entity's recipient set
    ///
    /// Allowed for the owner, or for `uid` removing themselves. The owner can
    /// never be revoked. The content key is not rotated.
    pub fn revoke_access(&self, id: &EntityId, caller: &UserId, uid: &UserId) -> Result<EncryptedEntity> {
        let stored = update_entity(
            self.docs.as_ref(),
            id,
            self.config.max_transaction_retries,
            |entity| {
                if !entity.is_owner(caller) && caller != uid {
                    return Err(ShareError::permission_denied(format!(
                        "{} may not revoke {} from entity {}",
                        caller, uid, entity.id
                    )));
                }
                entity.remove_recipient(uid)
            },
        )?;

        info!(entity_id = %id, caller = %caller, revoked = %uid, "Revoked access");
        Ok(stored)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fresh lookup of the caller's wrapped key
    pub fn fetch_wrapped_key(&self, id: &EntityId, uid: &UserId) -> Result<WrappedKey> {
        let entity = self.load(id)?;
        entity.wrapped_key_for(uid).cloned()
    }

    /// Fetches and decrypts the entity's content for `uid`
    pub fn read_content(&self, id: &EntityId, uid: &UserId, private_key: &PrivateKey) -> Result<Vec<u8>> {
        let entity = self.load(id)?;
        let content_key = unwrap_content_key(entity.wrapped_key_for(uid)?, private_key)?;
        let path = entity
            .storage_path
            .as_deref()
            .ok_or_else(|| ShareError::validation(format!("{} {} has no content", entity.kind, id)))?;

        let ciphertext = self.blobs.get(path)?;
        decrypt_with_content_key(&ciphertext, &content_key)
    }

    /// Fetches and decrypts the entity's metadata for `uid`
    pub fn read_metadata(&self, id: &EntityId, uid: &UserId, private_key: &PrivateKey) -> Result<Metadata> {
        let entity = self.load(id)?;
        let content_key = unwrap_content_key(entity.wrapped_key_for(uid)?, private_key)?;
        decrypt_metadata_with_key(&entity, &content_key)
    }

    /// Every entity `uid` can open, owned ones included
    pub fn list_accessible(&self, uid: &UserId) -> Result<Vec<EncryptedEntity>> {
        query_all(
            self.docs.as_ref(),
            &EntityFilter::SharedWith(uid.clone()),
            self.config.page_size,
        )
    }

    /// Every entity owned by `uid`
    pub fn list_owned(&self, uid: &UserId) -> Result<Vec<EncryptedEntity>> {
        query_all(
            self.docs.as_ref(),
            &EntityFilter::OwnedBy(uid.clone()),
            self.config.page_size,
        )
    }

    // =========================================================================
    // Key material maintenance
    // =========================================================================

    /// Encrypts any legacy plaintext metadata fields of the entity
    pub fn upgrade_metadata(&self, id: &EntityId, uid: &UserId, private_key: &PrivateKey) -> Result<EncryptedEntity> {
        let mut rng = OsRng;
        update_entity(
            self.docs.as_ref(),
            id,
            self.config.max_transaction_retries,
            |entity| {
                let content_key = unwrap_content_key(entity.wrapped_key_for(uid)?, private_key)?;
                upgrade_legacy_metadata(entity, &content_key, &mut rng)
            },
        )
    }

    /// Replaces the entity's content key; owner only
    ///
    /// Content and metadata are re-encrypted and the new key is wrapped for
    /// every remaining recipient under their published public key. The new
    /// ciphertext goes to a fresh storage path and the old blob is deleted
    /// only after the record commit.
    pub fn rotate_content_key(&self, id: &EntityId, owner: &UserId, owner_key: &PrivateKey) -> Result<EncryptedEntity> {
        let attempts = self.config.max_transaction_retries.max(1);
        for attempt in 1..=attempts {
            let current = self.load(id)?;
            if !current.is_owner(owner) {
                return Err(ShareError::permission_denied(format!(
                    "only the owner may rotate the key of entity {}",
                    id
                )));
            }

            let (mut rotated, new_path) = self.reencrypt(&current, owner, owner_key)?;
            rotated.updated_at = Some(self.docs.server_timestamp());

            match self.docs.compare_and_swap(&rotated, current.version) {
                Ok(stored) => {
                    if let Some(old_path) = &current.storage_path {
                        self.discard_blob(old_path);
                    }
                    info!(
                        entity_id = %id,
                        recipients = stored.shared_with.len(),
                        "Rotated content key"
                    );
                    return Ok(stored);
                }
                Err(e) => {
                    if let Some(path) = &new_path {
                        self.discard_blob(path);
                    }
                    match e {
                        ShareError::ConcurrentModification { .. } if attempt < attempts => {
                            debug!(entity_id = %id, attempt, "Version conflict on rotation, retrying");
                        }
                        other => return Err(other),
                    }
                }
            }
        }
        Err(ShareError::concurrent_modification(id))
    }

    /// Builds the rotated record; the new blob (if any) is already written
    fn reencrypt(
        &self,
        current: &EncryptedEntity,
        owner: &UserId,
        owner_key: &PrivateKey,
    ) -> Result<(EncryptedEntity, Option<String>)> {
        let mut rng = OsRng;
        let old_key = unwrap_content_key(current.wrapped_key_for(owner)?, owner_key)?;
        let new_key = ContentKey::generate(&mut rng)?;

        let metadata = decrypt_metadata_with_key(current, &old_key)?;
        let (name, size) = encrypt_metadata(&metadata, &new_key, &mut rng)?;

        let mut encrypted_keys = BTreeMap::new();
        for uid in &current.shared_with {
            let public_key = if uid == owner {
                owner_key.public_key()?
            } else {
                self.public_key_for(uid)?
            };
            encrypted_keys.insert(uid.clone(), wrap_content_key(&new_key, &public_key, &mut rng)?);
        }

        let mut rotated = current.clone();
        rotated.name = name;
        rotated.size = size;
        rotated.encrypted_keys = encrypted_keys;
        rotated.check_invariants()?;

        let new_path = match &current.storage_path {
            Some(old_path) => {
                let ciphertext = self.blobs.get(old_path)?;
                let plaintext = Zeroizing::new(decrypt_with_content_key(&ciphertext, &old_key)?);
                let reencrypted = encrypt_with_content_key(&plaintext, &new_key, &mut rng)?;
                let path = blob_path(&current.id);
                self.blobs.put(&path, &reencrypted)?;
                Some(path)
            }
            None => None,
        };
        rotated.storage_path = new_path.clone();

        Ok((rotated, new_path))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn load(&self, id: &EntityId) -> Result<EncryptedEntity> {
        self.docs
            .get(id)?
            .ok_or_else(|| ShareError::not_found(format!("entity {}", id)))
    }

    fn touch_interaction(&self, a: &UserId, b: &UserId) {
        let timestamp = self.docs.server_timestamp();
        if let Err(e) = self.interactions.record_interaction(a, b, timestamp) {
            warn!(a = %a, b = %b, error = %e, "Failed to record interaction");
        }
    }

    fn discard_blob(&self, path: &str) {
        if let Err(e) = self.blobs.delete(path) {
            warn!(path, error = %e, "Failed to delete orphaned blob");
        }
    }
}

fn blob_path(id: &EntityId) -> String {
    format!("{}/{}", id, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        manager: SharingManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let manager = SharingManager::with_store(store.clone(), SharingConfig::default());
        Fixture { store, manager }
    }

    fn user(fx: &Fixture, name: &str) -> (UserId, KeyPair) {
        let uid = UserId::new(name).unwrap();
        let key_pair = KeyPair::generate().unwrap();
        fx.store.register_public_key(&uid, key_pair.public_key()).unwrap();
        (uid, key_pair)
    }

    #[test]
    fn test_create_and_read_back() {
        let fx = fixture();
        let (alice, alice_keys) = user(&fx, "alice");

        let entity = fx
            .manager
            .create_entity(NewEntity::file(&alice, alice_keys.public_key(), "notes.txt", b"hello"))
            .unwrap();
        assert_eq!(entity.version, 1);
        assert!(entity.name.is_encrypted());

        let content = fx
            .manager
            .read_content(&entity.id, &alice, alice_keys.private_key())
            .unwrap();
        assert_eq!(content, b"hello");

        let metadata = fx
            .manager
            .read_metadata(&entity.id, &alice, alice_keys.private_key())
            .unwrap();
        assert_eq!(metadata, Metadata::new("notes.txt", Some(5)));
    }

    #[test]
    fn test_grant_is_idempotent() {
        let fx = fixture();
        let (alice, alice_keys) = user(&fx, "alice");
        let (bob, _) = user(&fx, "bob");

        let entity = fx
            .manager
            .create_entity(NewEntity::file(&alice, alice_keys.public_key(), "a", b"x"))
            .unwrap();
        let first = fx
            .manager
            .grant_access(&entity.id, &alice, alice_keys.private_key(), &bob)
            .unwrap();
        let second = fx
            .manager
            .grant_access(&entity.id, &alice, alice_keys.private_key(), &bob)
            .unwrap();
        assert_eq!(first.version, second.version);
        assert!(fx.store.last_interaction(&alice, &bob).unwrap().is_some());
    }

    #[test]
    fn test_folder_rejects_content() {
        let fx = fixture();
        let (alice, alice_keys) = user(&fx, "alice");
        let mut request = NewEntity::folder(&alice, alice_keys.public_key(), "dir");
        request.content = &b"nope"[..];
        assert!(matches!(
            fx.manager.create_entity(request),
            Err(ShareError::Validation(_))
        ));
    }

    /// Blob store whose deletes always fail
    struct UndeletableBlobs(MemoryStore);

    impl BlobStore for UndeletableBlobs {
        fn get(&self, path: &str) -> Result<Vec<u8>> {
            BlobStore::get(&self.0, path)
        }

        fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
            self.0.put(path, bytes)
        }

        fn delete(&self, _path: &str) -> Result<()> {
            Err(ShareError::storage("blob backend unavailable"))
        }
    }

    #[test]
    fn test_delete_reports_success_when_blob_cleanup_fails() {
        let store = Arc::new(MemoryStore::new());
        let manager = SharingManager::new(
            Arc::new(UndeletableBlobs(MemoryStore::new())),
            store.clone(),
            store.clone(),
            store.clone(),
            SharingConfig::default(),
        );
        let alice = UserId::new("alice").unwrap();
        let keys = KeyPair::generate().unwrap();
        store.register_public_key(&alice, keys.public_key()).unwrap();

        let entity = manager
            .create_entity(NewEntity::file(&alice, keys.public_key(), "a", b"x"))
            .unwrap();
        manager.delete_entity(&entity.id, &alice).unwrap();

        assert!(DocumentStore::get(store.as_ref(), &entity.id).unwrap().is_none());
        assert!(matches!(
            manager.delete_entity(&entity.id, &alice),
            Err(ShareError::NotFound(_))
        ));
    }

    #[test]
    fn test_enroll_refuses_second_key() {
        let fx = fixture();
        let uid = UserId::new("carol").unwrap();
        let kdf = KdfParams {
            memory_kib: 1024,
            iterations: 1,
            lanes: 1,
        };
        let passphrase = Passphrase::new("correct horse");
        fx.manager.enroll_user(&uid, &passphrase, &kdf).unwrap();
        assert!(fx.manager.unlock_private_key(&uid, &passphrase).is_ok());
        assert!(matches!(
            fx.manager.enroll_user(&uid, &passphrase, &kdf),
            Err(ShareError::Validation(_))
        ));
    }
}
