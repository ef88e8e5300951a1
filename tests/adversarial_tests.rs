//! Adversarial tests for pqshare
//!
//! These tests play a malicious or buggy backing store: ciphertexts are
//! flipped, wrapped keys swapped between documents, metadata moved between
//! fields and records corrupted out of band. Every such manipulation must be
//! rejected with an error that reveals nothing about which layer failed.

use pqshare::{
    config::SharingConfig,
    crypto::{
        decrypt, encrypt_for_recipients, unwrap_content_key, KeyPair, WrappedKey,
    },
    metadata::{decrypt_metadata, FieldValue},
    sharing::{NewEntity, SharingManager},
    store::{BlobStore, DocumentStore, MemoryStore},
    EncryptedEntity, ShareError, UserId,
};
use rand::{rngs::OsRng, Rng};
use std::collections::BTreeMap;
use std::sync::Arc;

struct World {
    store: Arc<MemoryStore>,
    sharing: SharingManager,
    alice: UserId,
    alice_keys: KeyPair,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let sharing = SharingManager::with_store(store.clone(), SharingConfig::default());
    let alice = UserId::new("alice").unwrap();
    let alice_keys = KeyPair::generate().unwrap();
    store.register_public_key(&alice, alice_keys.public_key()).unwrap();
    World {
        store,
        sharing,
        alice,
        alice_keys,
    }
}

fn create(w: &World, name: &str, content: &[u8]) -> EncryptedEntity {
    w.sharing
        .create_entity(NewEntity::file(&w.alice, w.alice_keys.public_key(), name, content))
        .unwrap()
}

#[test]
fn test_flipped_content_bits_are_rejected() {
    let w = world();
    let doc = create(&w, "a", b"integrity matters");
    let path = doc.storage_path.clone().unwrap();
    let original = BlobStore::get(w.store.as_ref(), &path).unwrap();

    let mut rng = OsRng;
    for _ in 0..20 {
        let mut tampered = original.clone();
        let index = rng.gen_range(0..tampered.len());
        tampered[index] ^= 1 << rng.gen_range(0..8);
        BlobStore::put(w.store.as_ref(), &path, &tampered).unwrap();

        let result = w.sharing.read_content(&doc.id, &w.alice, w.alice_keys.private_key());
        assert!(matches!(result, Err(ShareError::DecryptionFailed)));
    }

    // Truncation, including below the nonce size
    for len in [0, 5, 12, 27, original.len() - 1] {
        BlobStore::put(w.store.as_ref(), &path, &original[..len]).unwrap();
        let result = w.sharing.read_content(&doc.id, &w.alice, w.alice_keys.private_key());
        assert!(matches!(result, Err(ShareError::DecryptionFailed)));
    }
}

#[test]
fn test_flipped_wrapped_key_bits_are_rejected() {
    let keys = KeyPair::generate().unwrap();
    let mut recipients = BTreeMap::new();
    recipients.insert(UserId::new("a").unwrap(), keys.public_key().clone());
    let document = encrypt_for_recipients(b"secret", &recipients, &mut OsRng).unwrap();
    let wrapped = document.encrypted_keys.values().next().unwrap();

    let mut rng = OsRng;
    for _ in 0..20 {
        let mut bytes = wrapped.as_bytes().to_vec();
        let index = rng.gen_range(0..bytes.len());
        bytes[index] ^= 0x80;
        let tampered = WrappedKey::from_bytes(&bytes).unwrap();

        let result = decrypt(&document.ciphertext, &tampered, keys.private_key());
        assert!(matches!(result, Err(ShareError::DecryptionFailed)));
    }
}

#[test]
fn test_wrapped_key_from_other_document_is_rejected() {
    let w = world();
    let first = create(&w, "first", b"first document");
    let second = create(&w, "second", b"second document");

    // The store moves the first document's wrapped key onto the second
    let mut swapped = second.clone();
    swapped.encrypted_keys.insert(
        w.alice.clone(),
        first.wrapped_key_for(&w.alice).unwrap().clone(),
    );
    w.store.overwrite_entity(swapped).unwrap();

    assert!(matches!(
        w.sharing
            .read_content(&second.id, &w.alice, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
    assert!(matches!(
        w.sharing
            .read_metadata(&second.id, &w.alice, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
}

#[test]
fn test_metadata_moved_between_fields_or_records_is_rejected() {
    let w = world();
    let first = create(&w, "1234", b"x");
    let second = create(&w, "other", b"y");
    let wrapped = first.wrapped_key_for(&w.alice).unwrap();

    // Name ciphertext placed into the size field of the same record
    let mut moved = first.clone();
    moved.size = Some(first.name.clone());
    assert!(matches!(
        decrypt_metadata(&moved, wrapped, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));

    // Name ciphertext copied from another record
    let mut foreign = first.clone();
    foreign.name = second.name.clone();
    assert!(matches!(
        decrypt_metadata(&foreign, wrapped, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
}

#[test]
fn test_content_ciphertext_is_not_a_metadata_ciphertext() {
    let w = world();
    let doc = create(&w, "name", b"short");
    let blob = BlobStore::get(w.store.as_ref(), doc.storage_path.as_ref().unwrap()).unwrap();

    // Split the sealed content into nonce and body and present it as the name
    let (nonce, body) = blob.split_at(12);
    let mut forged = doc.clone();
    forged.name = FieldValue::Encrypted(pqshare::metadata::EncryptedField {
        ciphertext: body.to_vec(),
        nonce: nonce.to_vec(),
    });

    let wrapped = doc.wrapped_key_for(&w.alice).unwrap();
    assert!(matches!(
        decrypt_metadata(&forged, wrapped, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
}

#[test]
fn test_corrupted_record_is_not_extended() {
    let w = world();
    let bob = UserId::new("bob").unwrap();
    let bob_keys = KeyPair::generate().unwrap();
    w.store.register_public_key(&bob, bob_keys.public_key()).unwrap();

    let doc = create(&w, "a", b"x");

    // sharedWith lists a user without a wrapped key
    let mut corrupted = doc.clone();
    corrupted.shared_with.insert(UserId::new("mallory").unwrap());
    w.store.overwrite_entity(corrupted).unwrap();

    let result = w
        .sharing
        .grant_access(&doc.id, &w.alice, w.alice_keys.private_key(), &bob);
    assert!(matches!(result, Err(ShareError::InvariantViolation(_))));

    let stored = DocumentStore::get(w.store.as_ref(), &doc.id).unwrap().unwrap();
    assert!(!stored.has_access(&bob));
}

#[test]
fn test_malformed_wrapped_key_encodings() {
    assert!(WrappedKey::from_hex("zz").is_err());
    assert!(WrappedKey::from_hex("").is_err());
    assert!(WrappedKey::from_bytes(&[0u8; 100]).is_err());

    // A record whose wrapped key has the wrong length still fails closed
    let w = world();
    let doc = create(&w, "a", b"x");
    let json = serde_json::to_string(&doc).unwrap();
    let good_hex = doc.wrapped_key_for(&w.alice).unwrap().to_hex();
    let truncated = json.replace(&good_hex, &good_hex[..good_hex.len() - 2]);
    let parsed: EncryptedEntity = serde_json::from_str(&truncated).unwrap();

    let wrapped = parsed.wrapped_key_for(&w.alice).unwrap();
    assert!(matches!(
        unwrap_content_key(wrapped, w.alice_keys.private_key()),
        Err(ShareError::DecryptionFailed)
    ));
}

#[test]
fn test_errors_do_not_leak_layer_detail() {
    let w = world();
    let doc = create(&w, "a", b"x");
    let outsider = KeyPair::generate().unwrap();
    let wrapped = doc.wrapped_key_for(&w.alice).unwrap();

    let wrong_key = unwrap_content_key(wrapped, outsider.private_key()).unwrap_err();
    BlobStore::put(w.store.as_ref(), doc.storage_path.as_ref().unwrap(), b"garbage-garbage-garbage-garbage").unwrap();
    let bad_content = w
        .sharing
        .read_content(&doc.id, &w.alice, w.alice_keys.private_key())
        .unwrap_err();

    assert_eq!(wrong_key.to_string(), bad_content.to_string());
    assert_eq!(wrong_key.to_string(), "Decryption failed");
}
