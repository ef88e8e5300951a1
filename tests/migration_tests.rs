//! Key migration tests
//!
//! Cover the full migration lifecycle: rewrapping owned and shared entities,
//! idempotent re-runs, cancellation and resume, verification failures,
//! publication of the new key pair and recovery of a staged one.

use pqshare::{
    config::{MigrationConfig, SharingConfig},
    crypto::{unwrap_content_key, wrap_private_key, KdfParams, KeyPair, Passphrase},
    migration::{
        unlock_pending_key_pair, CancellationToken, KeyMigrationService, MigrationRequest,
        MigrationState,
    },
    retry::RetryConfig,
    sharing::{NewEntity, SharingManager},
    store::{DocumentStore, EntityFilter, MemoryStore, Page, PageRequest, ProfileStore},
    EncryptedEntity, EntityId, ShareError, UserId,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Hook = Box<dyn FnOnce() + Send>;

/// Document store over a `MemoryStore` that can fail one write per chosen
/// entity and run a hook once a given number of queries has returned
struct ScriptedDocs {
    inner: Arc<MemoryStore>,
    failing_writes: Mutex<BTreeSet<EntityId>>,
    queries: AtomicUsize,
    after_query: Mutex<Option<(usize, Hook)>>,
}

impl ScriptedDocs {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_writes: Mutex::new(BTreeSet::new()),
            queries: AtomicUsize::new(0),
            after_query: Mutex::new(None),
        }
    }

    fn fail_next_write(&self, id: &EntityId) {
        self.failing_writes.lock().unwrap().insert(id.clone());
    }

    fn after_queries(&self, count: usize, hook: Hook) {
        *self.after_query.lock().unwrap() = Some((count, hook));
    }
}

impl DocumentStore for ScriptedDocs {
    fn get(&self, id: &EntityId) -> pqshare::Result<Option<EncryptedEntity>> {
        DocumentStore::get(self.inner.as_ref(), id)
    }

    fn insert(&self, entity: &EncryptedEntity) -> pqshare::Result<EncryptedEntity> {
        self.inner.insert(entity)
    }

    fn compare_and_swap(
        &self,
        entity: &EncryptedEntity,
        expected_version: u64,
    ) -> pqshare::Result<EncryptedEntity> {
        if self.failing_writes.lock().unwrap().remove(&entity.id) {
            return Err(ShareError::storage("write rejected by the backend"));
        }
        self.inner.compare_and_swap(entity, expected_version)
    }

    fn delete(&self, id: &EntityId, expected_version: u64) -> pqshare::Result<()> {
        DocumentStore::delete(self.inner.as_ref(), id, expected_version)
    }

    fn query(&self, filter: &EntityFilter, page: &PageRequest) -> pqshare::Result<Page> {
        let result = self.inner.query(filter, page)?;
        let seen = self.queries.fetch_add(1, Ordering::SeqCst) + 1;

        let hook = {
            let mut slot = self.after_query.lock().unwrap();
            match slot.take() {
                Some((at, hook)) if at == seen => Some(hook),
                pending => {
                    *slot = pending;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(result)
    }

    fn server_timestamp(&self) -> u64 {
        self.inner.server_timestamp()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    sharing: SharingManager,
    alice: UserId,
    alice_keys: KeyPair,
    bob: UserId,
    bob_keys: KeyPair,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let sharing = SharingManager::with_store(store.clone(), SharingConfig::default());
    let alice = UserId::new("alice").unwrap();
    let bob = UserId::new("bob").unwrap();
    let alice_keys = KeyPair::generate().unwrap();
    let bob_keys = KeyPair::generate().unwrap();
    store.register_public_key(&alice, alice_keys.public_key()).unwrap();
    store.register_public_key(&bob, bob_keys.public_key()).unwrap();
    Fixture {
        store,
        sharing,
        alice,
        alice_keys,
        bob,
        bob_keys,
    }
}

fn config() -> MigrationConfig {
    MigrationConfig {
        page_size: 2,
        batch_size: 2,
        verify: RetryConfig::immediate(3),
        ..MigrationConfig::default()
    }
}

fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        lanes: 1,
    }
}

/// Alice owns three documents and has one shared by Bob
fn populate(fx: &Fixture) -> Vec<EntityId> {
    let mut ids = Vec::new();
    for i in 0..3 {
        let doc = fx
            .sharing
            .create_entity(NewEntity::file(
                &fx.alice,
                fx.alice_keys.public_key(),
                &format!("doc{}", i),
                format!("content {}", i).as_bytes(),
            ))
            .unwrap();
        ids.push(doc.id);
    }

    let shared = fx
        .sharing
        .create_entity(NewEntity::file(&fx.bob, fx.bob_keys.public_key(), "bob's", b"from bob"))
        .unwrap();
    fx.sharing
        .grant_access(&shared.id, &fx.bob, fx.bob_keys.private_key(), &fx.alice)
        .unwrap();
    ids.push(shared.id);

    // Not visible to Alice
    fx.sharing
        .create_entity(NewEntity::file(&fx.bob, fx.bob_keys.public_key(), "private", b"bob only"))
        .unwrap();

    ids
}

#[test]
fn test_migration_rewraps_everything_and_publishes() {
    let fx = fixture();
    let ids = populate(&fx);
    let new_keys = KeyPair::generate().unwrap();
    let passphrase = Passphrase::new("new passphrase");
    let wrapped = wrap_private_key(new_keys.private_key(), &passphrase, &fast_kdf()).unwrap();

    let service = KeyMigrationService::with_store(fx.store.clone(), config());
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: Some(&wrapped),
        only: None,
    };
    let report = service.migrate(&request, &CancellationToken::new()).unwrap();

    assert_eq!(report.state, MigrationState::Complete);
    assert!(report.is_success());
    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(report.already_migrated, 0);
    assert!(report.failed.is_empty());
    assert!(report.published);

    for id in &ids {
        let content = fx
            .sharing
            .read_content(id, &fx.alice, new_keys.private_key())
            .unwrap();
        assert!(!content.is_empty());
        assert!(matches!(
            fx.sharing.read_content(id, &fx.alice, fx.alice_keys.private_key()),
            Err(ShareError::DecryptionFailed)
        ));
    }

    // Bob's access to the shared document is untouched
    assert_eq!(
        fx.sharing
            .read_content(&ids[3], &fx.bob, fx.bob_keys.private_key())
            .unwrap(),
        b"from bob"
    );

    let published = fx.store.get_public_key(&fx.alice).unwrap().unwrap();
    assert_eq!(&published, new_keys.public_key());
    let unlocked = fx.sharing.unlock_private_key(&fx.alice, &passphrase).unwrap();
    assert_eq!(
        fx.sharing.read_content(&ids[0], &fx.alice, &unlocked).unwrap(),
        b"content 0"
    );
}

#[test]
fn test_rerun_is_idempotent_without_writes() {
    let fx = fixture();
    populate(&fx);
    let new_keys = KeyPair::generate().unwrap();
    let service = KeyMigrationService::with_store(fx.store.clone(), config());
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: None,
        only: None,
    };

    let first = service.migrate(&request, &CancellationToken::new()).unwrap();
    assert!(first.is_success());
    assert!(!first.published);

    let writes = fx.store.entity_writes();
    let second = service.migrate(&request, &CancellationToken::new()).unwrap();
    assert!(second.is_success());
    assert_eq!(second.already_migrated, 4);
    assert_eq!(second.succeeded.len(), 4);
    assert_eq!(fx.store.entity_writes(), writes);

    // Without a wrapped private key nothing is published
    let published = fx.store.get_public_key(&fx.alice).unwrap().unwrap();
    assert_eq!(&published, fx.alice_keys.public_key());
}

#[test]
fn test_undecryptable_entity_fails_and_blocks_publication() {
    let fx = fixture();
    let ids = populate(&fx);

    // Replace Alice's wrapped key with a valid-length key wrapped for Bob
    let mut broken = DocumentStore::get(fx.store.as_ref(), &ids[1]).unwrap().unwrap();
    let other_doc = DocumentStore::get(fx.store.as_ref(), &ids[3]).unwrap().unwrap();
    broken.encrypted_keys.insert(
        fx.alice.clone(),
        other_doc.wrapped_key_for(&fx.bob).unwrap().clone(),
    );
    fx.store.overwrite_entity(broken).unwrap();

    let new_keys = KeyPair::generate().unwrap();
    let wrapped = wrap_private_key(new_keys.private_key(), &Passphrase::new("pw"), &fast_kdf()).unwrap();
    let service = KeyMigrationService::with_store(fx.store.clone(), config());
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: Some(&wrapped),
        only: None,
    };
    let report = service.migrate(&request, &CancellationToken::new()).unwrap();

    assert_eq!(report.state, MigrationState::PartiallyFailed);
    assert!(!report.is_success());
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ids[1]);
    assert!(matches!(report.failed[0].1, ShareError::DecryptionFailed));
    assert!(!report.published);

    // The old key stays published, the new one waits in the pending slot
    let published = fx.store.get_public_key(&fx.alice).unwrap().unwrap();
    assert_eq!(&published, fx.alice_keys.public_key());
    let pending = fx.store.get_pending_key_pair(&fx.alice).unwrap().unwrap();
    assert_eq!(&pending.public_key, new_keys.public_key());
    assert_eq!(pending.wrapped_private_key, wrapped);
}

#[test]
fn test_partial_failure_keeps_every_entity_readable() {
    let fx = fixture();
    let ids = populate(&fx);
    let docs = Arc::new(ScriptedDocs::new(fx.store.clone()));
    docs.fail_next_write(&ids[2]);
    let service = KeyMigrationService::new(docs.clone(), fx.store.clone(), config());
    let passphrase = Passphrase::new("staged passphrase");

    // The caller drops the new key pair once the run fails
    let report = {
        let new_keys = KeyPair::generate().unwrap();
        let wrapped = wrap_private_key(new_keys.private_key(), &passphrase, &fast_kdf()).unwrap();
        let request = MigrationRequest {
            uid: &fx.alice,
            old_private_key: fx.alice_keys.private_key(),
            new_key_pair: &new_keys,
            new_wrapped_private_key: Some(&wrapped),
            only: None,
        };
        service.migrate(&request, &CancellationToken::new()).unwrap()
    };
    assert_eq!(report.state, MigrationState::PartiallyFailed);
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failed_ids(), BTreeSet::from([ids[2].clone()]));
    assert!(matches!(report.failed[0].1, ShareError::Storage(_)));
    assert!(!report.published);

    // Each entity opens under exactly one of the old key and the staged key
    let pending = service.pending_key_pair(&fx.alice).unwrap().unwrap();
    let recovered = unlock_pending_key_pair(&pending, &passphrase).unwrap();
    for id in &ids {
        let old = fx.sharing.read_content(id, &fx.alice, fx.alice_keys.private_key());
        let new = fx.sharing.read_content(id, &fx.alice, recovered.private_key());
        assert!(old.is_ok() != new.is_ok(), "entity {} must open under one key", id);
    }
    assert!(fx
        .sharing
        .read_content(&ids[2], &fx.alice, fx.alice_keys.private_key())
        .is_ok());
    assert!(matches!(
        unlock_pending_key_pair(&pending, &Passphrase::new("wrong")),
        Err(ShareError::InvalidPassphrase)
    ));

    // Starting over with another key pair would strand the migrated entities
    let other = KeyPair::generate().unwrap();
    let refused = service.migrate(
        &MigrationRequest {
            uid: &fx.alice,
            old_private_key: fx.alice_keys.private_key(),
            new_key_pair: &other,
            new_wrapped_private_key: None,
            only: None,
        },
        &CancellationToken::new(),
    );
    assert!(matches!(refused, Err(ShareError::Validation(_))));

    let resumed = service
        .migrate(
            &MigrationRequest {
                uid: &fx.alice,
                old_private_key: fx.alice_keys.private_key(),
                new_key_pair: &recovered,
                new_wrapped_private_key: Some(&pending.wrapped_private_key),
                only: None,
            },
            &CancellationToken::new(),
        )
        .unwrap();
    assert!(resumed.is_success());
    assert_eq!(resumed.already_migrated, 3);
    assert!(resumed.published);
    assert!(service.pending_key_pair(&fx.alice).unwrap().is_none());
    for id in &ids {
        assert!(fx.sharing.read_content(id, &fx.alice, recovered.private_key()).is_ok());
    }
}

#[test]
fn test_entity_shared_during_run_is_migrated() {
    let fx = fixture();
    let ids = populate(&fx);

    let carol = UserId::new("carol").unwrap();
    let carol_keys = KeyPair::generate().unwrap();
    fx.store.register_public_key(&carol, carol_keys.public_key()).unwrap();
    let late = fx
        .sharing
        .create_entity(NewEntity::file(&carol, carol_keys.public_key(), "late", b"shared mid-run"))
        .unwrap();

    // Both counting queries fit one page; Carol shares once the second returns
    let docs = Arc::new(ScriptedDocs::new(fx.store.clone()));
    let granter = SharingManager::with_store(fx.store.clone(), SharingConfig::default());
    let (late_id, alice) = (late.id.clone(), fx.alice.clone());
    docs.after_queries(
        2,
        Box::new(move || {
            granter
                .grant_access(&late_id, &carol, carol_keys.private_key(), &alice)
                .unwrap();
        }),
    );

    let new_keys = KeyPair::generate().unwrap();
    let wrapped = wrap_private_key(new_keys.private_key(), &Passphrase::new("pw"), &fast_kdf()).unwrap();
    let service = KeyMigrationService::new(
        docs.clone(),
        fx.store.clone(),
        MigrationConfig {
            page_size: 100,
            ..config()
        },
    );
    let report = service
        .migrate(
            &MigrationRequest {
                uid: &fx.alice,
                old_private_key: fx.alice_keys.private_key(),
                new_key_pair: &new_keys,
                new_wrapped_private_key: Some(&wrapped),
                only: None,
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(report.state, MigrationState::Complete);
    assert!(report.published);
    assert_eq!(report.total, ids.len() + 1);
    assert!(report.succeeded.contains(&late.id));
    assert!(docs.queries.load(Ordering::SeqCst) > 2);

    assert_eq!(
        fx.sharing
            .read_content(&late.id, &fx.alice, new_keys.private_key())
            .unwrap(),
        b"shared mid-run"
    );
    assert!(matches!(
        fx.sharing.read_content(&late.id, &fx.alice, fx.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
}

#[test]
fn test_cancelled_run_resumes_with_failed_ids() {
    let fx = fixture();
    populate(&fx);
    let new_keys = KeyPair::generate().unwrap();
    let service = KeyMigrationService::with_store(fx.store.clone(), config());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: None,
        only: None,
    };
    let cancelled = service.migrate(&request, &cancel).unwrap();
    assert_eq!(cancelled.state, MigrationState::PartiallyFailed);
    assert_eq!(cancelled.failed.len(), 4);
    assert!(cancelled
        .failed
        .iter()
        .all(|(_, e)| matches!(e, ShareError::Cancelled)));

    let remaining: BTreeSet<EntityId> = cancelled.failed_ids();
    let resume = MigrationRequest {
        only: Some(&remaining),
        ..request
    };
    let resumed = service.migrate(&resume, &CancellationToken::new()).unwrap();
    assert!(resumed.is_success());
    assert_eq!(resumed.total, 4);
    assert_eq!(resumed.succeeded.len(), 4);
}

#[test]
fn test_only_restricts_the_run() {
    let fx = fixture();
    let ids = populate(&fx);
    let new_keys = KeyPair::generate().unwrap();
    let service = KeyMigrationService::with_store(fx.store.clone(), config());

    let only: BTreeSet<EntityId> = [ids[0].clone()].into_iter().collect();
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: None,
        only: Some(&only),
    };
    let report = service.migrate(&request, &CancellationToken::new()).unwrap();
    assert_eq!(report.total, 1);

    let migrated = DocumentStore::get(fx.store.as_ref(), &ids[0]).unwrap().unwrap();
    assert!(unwrap_content_key(migrated.wrapped_key_for(&fx.alice).unwrap(), new_keys.private_key()).is_ok());
    let untouched = DocumentStore::get(fx.store.as_ref(), &ids[1]).unwrap().unwrap();
    assert!(unwrap_content_key(untouched.wrapped_key_for(&fx.alice).unwrap(), fx.alice_keys.private_key()).is_ok());
}

#[test]
fn test_user_without_entities_completes() {
    let fx = fixture();
    let new_keys = KeyPair::generate().unwrap();
    let service = KeyMigrationService::with_store(
        fx.store.clone(),
        MigrationConfig {
            verify_sample: Some(1),
            ..config()
        },
    );
    let request = MigrationRequest {
        uid: &fx.alice,
        old_private_key: fx.alice_keys.private_key(),
        new_key_pair: &new_keys,
        new_wrapped_private_key: None,
        only: None,
    };
    let report = service.migrate(&request, &CancellationToken::new()).unwrap();
    assert!(report.is_success());
    assert_eq!(report.total, 0);
}
