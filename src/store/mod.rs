//! Collaborator contracts for the backing stores.
//!
//! The sharing core never talks to a database directly. It consumes four
//! narrow traits:
//!
//! - [`BlobStore`]: opaque content bytes addressed by storage path
//! - [`DocumentStore`]: entity records with compare-and-swap updates and
//!   cursor-paginated queries
//! - [`ProfileStore`]: published public keys and passphrase-wrapped private
//!   keys, plus the key pair staged by an unfinished migration
//! - [`InteractionLog`]: last-interaction bookkeeping between two users
//!
//! Two implementations ship with the crate: [`memory::MemoryStore`] and
//! [`rocksdb::RocksStore`].

use crate::crypto::keys::PublicKey;
use crate::crypto::password::WrappedPrivateKey;
use crate::entity::EncryptedEntity;
use crate::error::{Result, ShareError};
use crate::types::{EntityId, UserId};
use crate::validation::Validator;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub mod memory;
pub mod rocksdb;

pub use self::memory::MemoryStore;
pub use self::rocksdb::RocksStore;

/// Default page size for paginated queries
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Content bytes addressed by an opaque storage path
pub trait BlobStore: Send + Sync {
    /// Returns the bytes at `path`, or `NotFound`
    fn get(&self, path: &str) -> Result<Vec<u8>>;
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
    /// Deleting a missing path is not an error
    fn delete(&self, path: &str) -> Result<()>;
}

/// Entity records with optimistic concurrency control
pub trait DocumentStore: Send + Sync {
    fn get(&self, id: &EntityId) -> Result<Option<EncryptedEntity>>;

    /// Inserts a new record and returns it as stored (version 1)
    fn insert(&self, entity: &EncryptedEntity) -> Result<EncryptedEntity>;

    /// Replaces the record if its stored version equals `expected_version`
    ///
    /// Returns the stored record with its bumped version, or
    /// `ConcurrentModification` when another writer got there first.
    fn compare_and_swap(
        &self,
        entity: &EncryptedEntity,
        expected_version: u64,
    ) -> Result<EncryptedEntity>;

    /// Deletes the record if its stored version equals `expected_version`
    fn delete(&self, id: &EntityId, expected_version: u64) -> Result<()>;

    /// Returns one page of records matching `filter`, ordered by id
    fn query(&self, filter: &EntityFilter, page: &PageRequest) -> Result<Page>;

    /// Server-assigned timestamp in milliseconds
    fn server_timestamp(&self) -> u64;
}

/// Published key material per user
pub trait ProfileStore: Send + Sync {
    /// Absence of a key is a normal condition, not an error
    fn get_public_key(&self, uid: &UserId) -> Result<Option<PublicKey>>;
    fn get_wrapped_private_key(&self, uid: &UserId) -> Result<Option<WrappedPrivateKey>>;
    /// Replaces the user's published key pair
    fn publish_key_pair(
        &self,
        uid: &UserId,
        public_key: &PublicKey,
        wrapped_private_key: &WrappedPrivateKey,
    ) -> Result<()>;

    /// Key pair staged by a migration that has not reached `Complete`
    fn get_pending_key_pair(&self, uid: &UserId) -> Result<Option<PendingKeyPair>>;
    /// Replaces any staged key pair
    fn stage_pending_key_pair(&self, uid: &UserId, pending: &PendingKeyPair) -> Result<()>;
    /// Clearing an empty slot is not an error
    fn clear_pending_key_pair(&self, uid: &UserId) -> Result<()>;
}

/// Last-interaction bookkeeping between users
pub trait InteractionLog: Send + Sync {
    fn record_interaction(&self, a: &UserId, b: &UserId, timestamp: u64) -> Result<()>;
}

/// A user's profile record as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_private_key: Option<WrappedPrivateKey>,
}

/// New key pair of an in-flight migration, stored before any entity is
/// rewrapped so migrated entities stay readable if the run stops early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingKeyPair {
    pub public_key: PublicKey,
    pub wrapped_private_key: WrappedPrivateKey,
}

/// Millisecond wall clock that never repeats or goes backwards
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub(crate) fn now_millis(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

/// Query filter over entity records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    /// Records whose owner is the user
    OwnedBy(UserId),
    /// Records whose `sharedWith` contains the user (owned records included)
    SharedWith(UserId),
}

impl EntityFilter {
    pub fn matches(&self, entity: &EncryptedEntity) -> bool {
        match self {
            EntityFilter::OwnedBy(uid) => &entity.owner == uid,
            EntityFilter::SharedWith(uid) => entity.shared_with.contains(uid),
        }
    }
}

/// Opaque pagination cursor: the id of the last record of the previous page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_id: EntityId,
}

impl Cursor {
    pub fn new(last_id: EntityId) -> Self {
        Self { last_id }
    }

    /// Encodes the cursor as a base64 string for URL-safe transport.
    pub fn encode(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.last_id.as_str())
    }

    /// Decodes a cursor from a base64 string.
    pub fn decode(s: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s).ok()?;
        let id = String::from_utf8(bytes).ok()?;
        EntityId::new(id).ok().map(Self::new)
    }
}

/// Page request: size plus an optional cursor
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub size: usize,
    pub after: Option<Cursor>,
}

impl PageRequest {
    pub fn first(size: usize) -> Self {
        Self { size, after: None }
    }

    pub fn after(size: usize, cursor: Cursor) -> Self {
        Self {
            size,
            after: Some(cursor),
        }
    }
}

/// Result of a paginated query.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<EncryptedEntity>,
    /// Cursor for the next page, if there are more items.
    pub next_cursor: Option<Cursor>,
}

impl Page {
    /// Returns true if there are more pages after this one.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// Drains every page of a query
pub fn query_all(
    docs: &dyn DocumentStore,
    filter: &EntityFilter,
    page_size: usize,
) -> Result<Vec<EncryptedEntity>> {
    Validator::validate_page_size(page_size)?;

    let mut items = Vec::new();
    let mut request = PageRequest::first(page_size);
    let mut pages = 0usize;
    loop {
        let page = docs.query(filter, &request)?;
        pages += 1;
        items.extend(page.items);
        match page.next_cursor {
            Some(cursor) => request = PageRequest::after(page_size, cursor),
            None => break,
        }
    }

    debug!(?filter, pages, records = items.len(), "Drained paginated query");
    Ok(items)
}

/// Atomically applies `mutate` to one entity
///
/// The record is read fresh, mutated, checked against the recipient-set
/// invariants and written back with compare-and-swap. On a version conflict
/// the whole read-mutate-write is repeated, up to `max_attempts` times. A
/// closure returning `Ok(false)` leaves the record untouched.
pub fn update_entity<F>(
    docs: &dyn DocumentStore,
    id: &EntityId,
    max_attempts: u32,
    mut mutate: F,
) -> Result<EncryptedEntity>
where
    F: FnMut(&mut EncryptedEntity) -> Result<bool>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let current = docs
            .get(id)
            .and_then(|e| e.ok_or_else(|| ShareError::not_found(format!("entity {}", id))))?;

        let mut updated = current.clone();
        if !mutate(&mut updated)? {
            return Ok(current);
        }
        updated.check_invariants()?;
        updated.updated_at = Some(docs.server_timestamp());

        match docs.compare_and_swap(&updated, current.version) {
            Ok(stored) => return Ok(stored),
            Err(ShareError::ConcurrentModification { .. }) if attempt < attempts => {
                debug!(entity_id = %id, attempt, "Version conflict, retrying with fresh read");
            }
            Err(e) => {
                if matches!(e, ShareError::ConcurrentModification { .. }) {
                    warn!(entity_id = %id, attempts, "Giving up after repeated version conflicts");
                }
                return Err(e);
            }
        }
    }

    Err(ShareError::concurrent_modification(id))
}
