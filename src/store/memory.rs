//! In-process implementation of every store trait.

use super::{
    BlobStore, Cursor, DocumentStore, EntityFilter, InteractionLog, MonotonicClock, Page,
    PageRequest, PendingKeyPair, ProfileRecord, ProfileStore,
};
use crate::crypto::keys::PublicKey;
use crate::crypto::password::WrappedPrivateKey;
use crate::entity::EncryptedEntity;
use crate::error::{Result, ShareError};
use crate::types::{EntityId, UserId};
use crate::validation::Validator;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Maps behind mutexes, with a monotonic clock and a write counter
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<BTreeMap<EntityId, EncryptedEntity>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    profiles: Mutex<HashMap<UserId, ProfileRecord>>,
    pending: Mutex<HashMap<UserId, PendingKeyPair>>,
    interactions: Mutex<HashMap<(UserId, UserId), u64>>,
    clock: MonotonicClock,
    entity_writes: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ShareError::storage("memory store lock poisoned"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a public key without a wrapped private key
    pub fn register_public_key(&self, uid: &UserId, public_key: &PublicKey) -> Result<()> {
        let mut profiles = lock(&self.profiles)?;
        let record = profiles.entry(uid.clone()).or_insert_with(|| ProfileRecord {
            public_key: public_key.clone(),
            wrapped_private_key: None,
        });
        record.public_key = public_key.clone();
        Ok(())
    }

    /// Number of successful insert, compare-and-swap and delete calls
    pub fn entity_writes(&self) -> u64 {
        self.entity_writes.load(Ordering::SeqCst)
    }

    /// Replaces a record without any version check
    ///
    /// Used to simulate out-of-band corruption and concurrent writers.
    pub fn overwrite_entity(&self, entity: EncryptedEntity) -> Result<()> {
        lock(&self.entities)?.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Returns the last interaction timestamp recorded between two users
    pub fn last_interaction(&self, a: &UserId, b: &UserId) -> Result<Option<u64>> {
        Ok(lock(&self.interactions)?.get(&interaction_key(a, b)).copied())
    }

    pub fn blob_count(&self) -> Result<usize> {
        Ok(lock(&self.blobs)?.len())
    }
}

fn interaction_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.blobs)?
            .get(path)
            .cloned()
            .ok_or_else(|| ShareError::not_found(format!("blob {}", path)))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        lock(&self.blobs)?.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        lock(&self.blobs)?.remove(path);
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, id: &EntityId) -> Result<Option<EncryptedEntity>> {
        Ok(lock(&self.entities)?.get(id).cloned())
    }

    fn insert(&self, entity: &EncryptedEntity) -> Result<EncryptedEntity> {
        let mut entities = lock(&self.entities)?;
        if entities.contains_key(&entity.id) {
            return Err(ShareError::storage(format!("entity {} already exists", entity.id)));
        }
        let mut stored = entity.clone();
        stored.version = 1;
        stored.updated_at = Some(self.server_timestamp());
        entities.insert(stored.id.clone(), stored.clone());
        self.entity_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn compare_and_swap(
        &self,
        entity: &EncryptedEntity,
        expected_version: u64,
    ) -> Result<EncryptedEntity> {
        let mut entities = lock(&self.entities)?;
        let current = entities
            .get(&entity.id)
            .ok_or_else(|| ShareError::not_found(format!("entity {}", entity.id)))?;
        if current.version != expected_version {
            return Err(ShareError::concurrent_modification(&entity.id));
        }

        let mut stored = entity.clone();
        stored.version = expected_version + 1;
        entities.insert(stored.id.clone(), stored.clone());
        self.entity_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn delete(&self, id: &EntityId, expected_version: u64) -> Result<()> {
        let mut entities = lock(&self.entities)?;
        match entities.get(id) {
            Some(current) if current.version != expected_version => {
                Err(ShareError::concurrent_modification(id))
            }
            Some(_) => {
                entities.remove(id);
                self.entity_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ShareError::not_found(format!("entity {}", id))),
        }
    }

    fn query(&self, filter: &EntityFilter, page: &PageRequest) -> Result<Page> {
        Validator::validate_page_size(page.size)?;
        let entities = lock(&self.entities)?;

        let lower = match &page.after {
            Some(cursor) => Bound::Excluded(cursor.last_id.clone()),
            None => Bound::Unbounded,
        };

        let mut items: Vec<EncryptedEntity> = entities
            .range((lower, Bound::Unbounded))
            .map(|(_, entity)| entity)
            .filter(|entity| filter.matches(entity))
            .take(page.size + 1)
            .cloned()
            .collect();

        let next_cursor = if items.len() > page.size {
            items.truncate(page.size);
            items.last().map(|last| Cursor::new(last.id.clone()))
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    fn server_timestamp(&self) -> u64 {
        self.clock.now_millis()
    }
}

impl ProfileStore for MemoryStore {
    fn get_public_key(&self, uid: &UserId) -> Result<Option<PublicKey>> {
        Ok(lock(&self.profiles)?
            .get(uid)
            .map(|record| record.public_key.clone()))
    }

    fn get_wrapped_private_key(&self, uid: &UserId) -> Result<Option<WrappedPrivateKey>> {
        Ok(lock(&self.profiles)?
            .get(uid)
            .and_then(|record| record.wrapped_private_key.clone()))
    }

    fn publish_key_pair(
        &self,
        uid: &UserId,
        public_key: &PublicKey,
        wrapped_private_key: &WrappedPrivateKey,
    ) -> Result<()> {
        lock(&self.profiles)?.insert(
            uid.clone(),
            ProfileRecord {
                public_key: public_key.clone(),
                wrapped_private_key: Some(wrapped_private_key.clone()),
            },
        );
        Ok(())
    }

    fn get_pending_key_pair(&self, uid: &UserId) -> Result<Option<PendingKeyPair>> {
        Ok(lock(&self.pending)?.get(uid).cloned())
    }

    fn stage_pending_key_pair(&self, uid: &UserId, pending: &PendingKeyPair) -> Result<()> {
        lock(&self.pending)?.insert(uid.clone(), pending.clone());
        Ok(())
    }

    fn clear_pending_key_pair(&self, uid: &UserId) -> Result<()> {
        lock(&self.pending)?.remove(uid);
        Ok(())
    }
}

impl InteractionLog for MemoryStore {
    fn record_interaction(&self, a: &UserId, b: &UserId, timestamp: u64) -> Result<()> {
        let mut interactions = lock(&self.interactions)?;
        let entry = interactions.entry(interaction_key(a, b)).or_insert(0);
        *entry = (*entry).max(timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::{WrappedKey, WRAPPED_KEY_SIZE};
    use crate::entity::EntityKind;
    use crate::metadata::FieldValue;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn entity(id: &str, owner: &str) -> EncryptedEntity {
        EncryptedEntity::new(
            EntityId::new(id).unwrap(),
            EntityKind::File,
            uid(owner),
            WrappedKey::from_bytes(&[7u8; WRAPPED_KEY_SIZE]).unwrap(),
            FieldValue::Plaintext(id.to_string()),
        )
    }

    #[test]
    fn test_compare_and_swap_detects_stale_version() {
        let store = MemoryStore::new();
        let stored = store.insert(&entity("a", "alice")).unwrap();
        assert_eq!(stored.version, 1);

        let updated = store.compare_and_swap(&stored, 1).unwrap();
        assert_eq!(updated.version, 2);

        let stale = store.compare_and_swap(&stored, 1);
        assert!(matches!(stale, Err(ShareError::ConcurrentModification { .. })));
        assert_eq!(store.entity_writes(), 2);
    }

    #[test]
    fn test_query_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(&entity(&format!("doc-{}", i), "alice")).unwrap();
        }
        store.insert(&entity("doc-x", "bob")).unwrap();

        let filter = EntityFilter::OwnedBy(uid("alice"));
        let first = store.query(&filter, &PageRequest::first(2)).unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more());

        let all = crate::store::query_all(&store, &filter, 2).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|e| e.owner == uid("alice")));
    }

    #[test]
    fn test_server_timestamp_is_monotonic() {
        let store = MemoryStore::new();
        let a = store.server_timestamp();
        let b = store.server_timestamp();
        assert!(b > a);
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(BlobStore::get(&store, "nope"), Err(ShareError::NotFound(_))));
    }
}
