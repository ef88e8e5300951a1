//! Bulk access removal.
//!
//! Thin coordinator over [`SharingManager`]: each entity is revoked (or
//! deleted) independently, so one failure never aborts the rest.

use crate::error::Result;
use crate::sharing::SharingManager;
use crate::store::{query_all, EntityFilter};
use crate::types::{BatchReport, EntityId, UserId};
use std::sync::Arc;
use tracing::{info, warn};

pub struct AccessRevocationService {
    sharing: Arc<SharingManager>,
}

impl AccessRevocationService {
    pub fn new(sharing: Arc<SharingManager>) -> Self {
        Self { sharing }
    }

    /// Revokes `contact` from every entity owned by `owner`
    ///
    /// Entities the contact never had access to are skipped and do not
    /// appear in the report.
    pub fn remove_contact(&self, owner: &UserId, contact: &UserId) -> Result<BatchReport<EntityId>> {
        let owned = query_all(
            self.sharing.documents().as_ref(),
            &EntityFilter::OwnedBy(owner.clone()),
            self.sharing.config().page_size,
        )?;

        let mut report = BatchReport::new();
        for entity in owned.into_iter().filter(|e| e.has_access(contact)) {
            match self.sharing.revoke_access(&entity.id, owner, contact) {
                Ok(_) => report.record_success(entity.id),
                Err(e) => {
                    warn!(entity_id = %entity.id, contact = %contact, error = %e, "Revocation failed");
                    report.record_failure(entity.id, e);
                }
            }
        }

        info!(
            owner = %owner,
            contact = %contact,
            revoked = report.succeeded.len(),
            failed = report.failed.len(),
            "Removed contact"
        );
        Ok(report)
    }

    /// Detaches `uid` from everything shared with it and deletes everything it owns
    pub fn remove_account(&self, uid: &UserId) -> Result<BatchReport<EntityId>> {
        let accessible = query_all(
            self.sharing.documents().as_ref(),
            &EntityFilter::SharedWith(uid.clone()),
            self.sharing.config().page_size,
        )?;

        let mut report = BatchReport::new();
        for entity in accessible {
            let outcome = if entity.is_owner(uid) {
                self.sharing.delete_entity(&entity.id, uid)
            } else {
                self.sharing.revoke_access(&entity.id, uid, uid).map(|_| ())
            };

            match outcome {
                Ok(()) => report.record_success(entity.id),
                Err(e) => {
                    warn!(entity_id = %entity.id, uid = %uid, error = %e, "Account removal step failed");
                    report.record_failure(entity.id, e);
                }
            }
        }

        info!(
            uid = %uid,
            processed = report.succeeded.len(),
            failed = report.failed.len(),
            "Removed account"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharingConfig;
    use crate::crypto::keys::KeyPair;
    use crate::sharing::NewEntity;
    use crate::store::{DocumentStore, MemoryStore};

    #[test]
    fn test_remove_contact_only_touches_owned_entities() {
        let store = Arc::new(MemoryStore::new());
        let sharing = Arc::new(SharingManager::with_store(store.clone(), SharingConfig::default()));
        let service = AccessRevocationService::new(sharing.clone());

        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();
        let alice_keys = KeyPair::generate().unwrap();
        let bob_keys = KeyPair::generate().unwrap();
        store.register_public_key(&alice, alice_keys.public_key()).unwrap();
        store.register_public_key(&bob, bob_keys.public_key()).unwrap();

        let mine = sharing
            .create_entity(NewEntity::file(&alice, alice_keys.public_key(), "a", b"a"))
            .unwrap();
        let theirs = sharing
            .create_entity(NewEntity::file(&bob, bob_keys.public_key(), "b", b"b"))
            .unwrap();
        sharing
            .grant_access(&mine.id, &alice, alice_keys.private_key(), &bob)
            .unwrap();
        sharing
            .grant_access(&theirs.id, &bob, bob_keys.private_key(), &alice)
            .unwrap();

        let report = service.remove_contact(&alice, &bob).unwrap();
        assert_eq!(report.succeeded, vec![mine.id.clone()]);
        assert!(report.is_complete());

        let mine = DocumentStore::get(store.as_ref(), &mine.id).unwrap().unwrap();
        let theirs = DocumentStore::get(store.as_ref(), &theirs.id).unwrap().unwrap();
        assert!(!mine.has_access(&bob));
        assert!(theirs.has_access(&alice));
    }
}
