//! RocksDB-backed implementation of every store trait.
//!
//! ## Column families
//!
//! - `entities`: entity id -> JSON record (persisted layout)
//! - `blobs`: storage path -> raw ciphertext
//! - `profiles`: user id -> JSON [`ProfileRecord`]
//! - `pending_keys`: user id -> JSON [`PendingKeyPair`]
//! - `interactions`: `uid_a:uid_b` (sorted) -> JSON timestamp
//! - `idx_owner`: `owner:entity_id` -> ()
//! - `idx_access`: `uid:entity_id` -> () for every member of `sharedWith`
//!
//! Index entries are written in the same batch as the record, so a query
//! never observes an index pointing at a stale recipient set.

use super::{
    BlobStore, Cursor, DocumentStore, EntityFilter, InteractionLog, MonotonicClock, Page,
    PageRequest, PendingKeyPair, ProfileRecord, ProfileStore,
};
use crate::config::StorageConfig;
use crate::crypto::keys::PublicKey;
use crate::crypto::password::WrappedPrivateKey;
use crate::entity::EncryptedEntity;
use crate::error::{Result, ShareError};
use crate::types::{EntityId, UserId};
use crate::validation::Validator;
use ::rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const CF_ENTITIES: &str = "entities";
const CF_BLOBS: &str = "blobs";
const CF_PROFILES: &str = "profiles";
const CF_PENDING_KEYS: &str = "pending_keys";
const CF_INTERACTIONS: &str = "interactions";
const CF_IDX_OWNER: &str = "idx_owner";
const CF_IDX_ACCESS: &str = "idx_access";

const COLUMN_FAMILIES: &[&str] = &[
    CF_ENTITIES,
    CF_BLOBS,
    CF_PROFILES,
    CF_PENDING_KEYS,
    CF_INTERACTIONS,
    CF_IDX_OWNER,
    CF_IDX_ACCESS,
];

/// Subdirectory of the data directory holding the database
pub const DB_DIR: &str = "share_db";

fn db_options(config: &StorageConfig) -> Options {
    let threads = match config.background_threads {
        0 => num_cpus::get(),
        n => n,
    };

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_max_open_files(config.max_open_files);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_total_wal_size(config.max_total_wal_size);
    opts.increase_parallelism(i32::try_from(threads).unwrap_or(i32::MAX));
    opts.set_compression_type(::rocksdb::DBCompressionType::Lz4);
    opts
}

fn storage_error(action: &'static str) -> impl Fn(::rocksdb::Error) -> ShareError {
    move |e| ShareError::storage(format!("{} failed: {}", action, e))
}

/// `uid:suffix`; user ids never contain `:`, so `uid:` is an exact prefix
fn index_key(uid: &UserId, suffix: &[u8]) -> Vec<u8> {
    let uid = uid.as_str().as_bytes();
    let mut key = Vec::with_capacity(uid.len() + 1 + suffix.len());
    key.extend_from_slice(uid);
    key.push(b':');
    key.extend_from_slice(suffix);
    key
}

fn interaction_key(a: &UserId, b: &UserId) -> Vec<u8> {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    index_key(first, second.as_str().as_bytes())
}

/// RocksDB-backed store
pub struct RocksStore {
    db: DB,
    /// Serializes read-compare-write on entity records
    write_lock: Mutex<()>,
    clock: MonotonicClock,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl RocksStore {
    /// Opens (or creates) the store under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let db_path = data_dir.as_ref().join(DB_DIR);
        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&db_options(config), &db_path, descriptors)
            .map_err(storage_error("opening the share store"))?;

        info!(path = %db_path.display(), "Opened share store");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            clock: MonotonicClock::default(),
        })
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| ShareError::storage("write lock poisoned"))
    }

    fn column(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ShareError::storage(format!("column family {} is missing", name)))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let bytes = self
            .db
            .get_cf(self.column(cf)?, key)
            .map_err(storage_error("read"))?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .put_cf(self.column(cf)?, key, bytes)
            .map_err(storage_error("write"))
    }

    fn load_entity(&self, id: &EntityId) -> Result<Option<EncryptedEntity>> {
        self.read(CF_ENTITIES, id.as_str().as_bytes())
    }

    /// Writes the record change between `old` and `new` and every index
    /// change it implies in one batch
    fn commit_entity(&self, old: Option<&EncryptedEntity>, new: Option<&EncryptedEntity>) -> Result<()> {
        let Some(id) = old.or(new).map(|e| e.id.as_str().as_bytes()) else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();

        let records = self.column(CF_ENTITIES)?;
        match new {
            Some(entity) => batch.put_cf(records, id, serde_json::to_vec(entity)?),
            None => batch.delete_cf(records, id),
        }

        let owners = self.column(CF_IDX_OWNER)?;
        let old_owner = old.map(|e| &e.owner);
        let new_owner = new.map(|e| &e.owner);
        if old_owner != new_owner {
            if let Some(owner) = old_owner {
                batch.delete_cf(owners, index_key(owner, id));
            }
            if let Some(owner) = new_owner {
                batch.put_cf(owners, index_key(owner, id), b"");
            }
        }

        let access = self.column(CF_IDX_ACCESS)?;
        let empty = BTreeSet::new();
        let old_members = old.map(|e| &e.shared_with).unwrap_or(&empty);
        let new_members = new.map(|e| &e.shared_with).unwrap_or(&empty);
        for uid in old_members.difference(new_members) {
            batch.delete_cf(access, index_key(uid, id));
        }
        for uid in new_members.difference(old_members) {
            batch.put_cf(access, index_key(uid, id), b"");
        }

        self.db.write(batch).map_err(storage_error("entity write"))
    }

    /// Entity ids indexed under `uid`, strictly after `after`, at most
    /// `limit + 1` of them so the caller can tell whether more remain
    fn scan_index(
        &self,
        cf: &str,
        uid: &UserId,
        after: Option<&EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let prefix = index_key(uid, &[]);
        let start = match after {
            Some(id) => index_key(uid, id.as_str().as_bytes()),
            None => prefix.clone(),
        };

        let mut ids = Vec::with_capacity(limit + 1);
        let entries = self
            .db
            .iterator_cf(self.column(cf)?, IteratorMode::From(start.as_slice(), Direction::Forward));
        for entry in entries {
            let (key, _) = entry.map_err(storage_error("index scan"))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if after.is_some() && key[..] == start[..] {
                continue;
            }

            let id = std::str::from_utf8(&key[prefix.len()..])
                .ok()
                .and_then(|raw| EntityId::new(raw).ok())
                .ok_or_else(|| ShareError::storage(format!("corrupt key in index {}", cf)))?;
            ids.push(id);
            if ids.len() > limit {
                break;
            }
        }
        Ok(ids)
    }
}

impl BlobStore for RocksStore {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.db
            .get_cf(self.column(CF_BLOBS)?, path.as_bytes())
            .map_err(storage_error("blob read"))?
            .ok_or_else(|| ShareError::not_found(format!("blob {}", path)))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.column(CF_BLOBS)?, path.as_bytes(), bytes)
            .map_err(storage_error("blob write"))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.db
            .delete_cf(self.column(CF_BLOBS)?, path.as_bytes())
            .map_err(storage_error("blob delete"))
    }
}

impl DocumentStore for RocksStore {
    fn get(&self, id: &EntityId) -> Result<Option<EncryptedEntity>> {
        self.load_entity(id)
    }

    fn insert(&self, entity: &EncryptedEntity) -> Result<EncryptedEntity> {
        let _guard = self.lock_writes()?;
        if self.load_entity(&entity.id)?.is_some() {
            return Err(ShareError::storage(format!("entity {} already exists", entity.id)));
        }

        let mut stored = entity.clone();
        stored.version = 1;
        stored.updated_at = Some(self.clock.now_millis());
        self.commit_entity(None, Some(&stored))?;

        debug!(entity_id = %stored.id, owner = %stored.owner, "Inserted entity");
        Ok(stored)
    }

    fn compare_and_swap(
        &self,
        entity: &EncryptedEntity,
        expected_version: u64,
    ) -> Result<EncryptedEntity> {
        let _guard = self.lock_writes()?;
        let current = self
            .load_entity(&entity.id)?
            .ok_or_else(|| ShareError::not_found(format!("entity {}", entity.id)))?;
        if current.version != expected_version {
            debug!(
                entity_id = %entity.id,
                expected_version,
                actual_version = current.version,
                "Compare-and-swap rejected"
            );
            return Err(ShareError::concurrent_modification(&entity.id));
        }

        let mut stored = entity.clone();
        stored.version = expected_version + 1;
        self.commit_entity(Some(&current), Some(&stored))?;
        Ok(stored)
    }

    fn delete(&self, id: &EntityId, expected_version: u64) -> Result<()> {
        let _guard = self.lock_writes()?;
        let current = self
            .load_entity(id)?
            .ok_or_else(|| ShareError::not_found(format!("entity {}", id)))?;
        if current.version != expected_version {
            return Err(ShareError::concurrent_modification(id));
        }
        self.commit_entity(Some(&current), None)
    }

    fn query(&self, filter: &EntityFilter, page: &PageRequest) -> Result<Page> {
        Validator::validate_page_size(page.size)?;

        let (cf, uid) = match filter {
            EntityFilter::OwnedBy(uid) => (CF_IDX_OWNER, uid),
            EntityFilter::SharedWith(uid) => (CF_IDX_ACCESS, uid),
        };
        let after = page.after.as_ref().map(|cursor| &cursor.last_id);
        let mut ids = self.scan_index(cf, uid, after, page.size)?;

        let has_more = ids.len() > page.size;
        ids.truncate(page.size);

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.load_entity(id)? {
                Some(entity) => items.push(entity),
                None => warn!(entity_id = %id, index = cf, "Index entry without record"),
            }
        }

        let next_cursor = if has_more {
            ids.last().cloned().map(Cursor::new)
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    fn server_timestamp(&self) -> u64 {
        self.clock.now_millis()
    }
}

impl ProfileStore for RocksStore {
    fn get_public_key(&self, uid: &UserId) -> Result<Option<PublicKey>> {
        let record: Option<ProfileRecord> = self.read(CF_PROFILES, uid.as_str().as_bytes())?;
        Ok(record.map(|r| r.public_key))
    }

    fn get_wrapped_private_key(&self, uid: &UserId) -> Result<Option<WrappedPrivateKey>> {
        let record: Option<ProfileRecord> = self.read(CF_PROFILES, uid.as_str().as_bytes())?;
        Ok(record.and_then(|r| r.wrapped_private_key))
    }

    fn publish_key_pair(
        &self,
        uid: &UserId,
        public_key: &PublicKey,
        wrapped_private_key: &WrappedPrivateKey,
    ) -> Result<()> {
        let record = ProfileRecord {
            public_key: public_key.clone(),
            wrapped_private_key: Some(wrapped_private_key.clone()),
        };
        self.write(CF_PROFILES, uid.as_str().as_bytes(), &record)?;
        info!(uid = %uid, fingerprint = %public_key.fingerprint_hex(), "Published key pair");
        Ok(())
    }

    fn get_pending_key_pair(&self, uid: &UserId) -> Result<Option<PendingKeyPair>> {
        self.read(CF_PENDING_KEYS, uid.as_str().as_bytes())
    }

    fn stage_pending_key_pair(&self, uid: &UserId, pending: &PendingKeyPair) -> Result<()> {
        self.write(CF_PENDING_KEYS, uid.as_str().as_bytes(), pending)?;
        debug!(uid = %uid, fingerprint = %pending.public_key.fingerprint_hex(), "Staged pending key pair");
        Ok(())
    }

    fn clear_pending_key_pair(&self, uid: &UserId) -> Result<()> {
        self.db
            .delete_cf(self.column(CF_PENDING_KEYS)?, uid.as_str().as_bytes())
            .map_err(storage_error("pending key delete"))
    }
}

impl InteractionLog for RocksStore {
    fn record_interaction(&self, a: &UserId, b: &UserId, timestamp: u64) -> Result<()> {
        let key = interaction_key(a, b);

        let _guard = self.lock_writes()?;
        let previous: Option<u64> = self.read(CF_INTERACTIONS, &key)?;
        if previous.is_some_and(|p| p >= timestamp) {
            return Ok(());
        }
        self.write(CF_INTERACTIONS, &key, &timestamp)
    }
}
