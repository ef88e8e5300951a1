//! # pqshare - post-quantum multi-recipient file sharing
//!
//! End-to-end encrypted sharing of files and folders between users. The
//! backing stores only ever see ciphertext: every document is sealed under a
//! random content key, and that key is wrapped once per recipient with
//! ML-KEM-1024. Granting access wraps the existing content key for one more
//! user; the content itself is never re-encrypted.
//!
//! ## Components
//!
//! - **Key pairs**: [`crypto::KeyPair`] generation and passphrase wrapping of
//!   private keys ([`crypto::wrap_private_key`])
//! - **Envelope encryption**: [`crypto::encrypt_for_recipients`],
//!   [`crypto::decrypt`], [`crypto::rewrap_content_key`]
//! - **Metadata**: name and size sealed under the content key ([`metadata`])
//! - **Sharing**: [`sharing::SharingManager`] for grants, revocations and
//!   content-key rotation
//! - **Key migration**: [`migration::KeyMigrationService`]
//! - **Bulk revocation**: [`revocation::AccessRevocationService`]
//!
//! ## Cryptographic Algorithms
//!
//! - **Key Encapsulation**: ML-KEM-1024 (NIST FIPS 203)
//! - **Symmetric Encryption**: AES-256-GCM
//! - **Key Derivation**: HKDF-SHA3-256 (wrapping keys), Argon2id (passphrases)
//!
//! ## Example
//!
//! ```rust,no_run
//! use pqshare::config::SharingConfig;
//! use pqshare::crypto::KeyPair;
//! use pqshare::sharing::{NewEntity, SharingManager};
//! use pqshare::store::MemoryStore;
//! use pqshare::UserId;
//! use std::sync::Arc;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let sharing = SharingManager::with_store(store.clone(), SharingConfig::default());
//!
//! let alice = UserId::new("alice")?;
//! let bob = UserId::new("bob")?;
//! let alice_keys = KeyPair::generate()?;
//! let bob_keys = KeyPair::generate()?;
//! store.register_public_key(&alice, alice_keys.public_key())?;
//! store.register_public_key(&bob, bob_keys.public_key())?;
//!
//! let doc = sharing.create_entity(NewEntity::file(
//!     &alice,
//!     alice_keys.public_key(),
//!     "plan.txt",
//!     b"meet at noon",
//! ))?;
//! sharing.grant_access(&doc.id, &alice, alice_keys.private_key(), &bob)?;
//! let content = sharing.read_content(&doc.id, &bob, bob_keys.private_key())?;
//! assert_eq!(content, b"meet at noon");
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod migration;
pub mod retry;
pub mod revocation;
pub mod sharing;
pub mod store;
pub mod types;
pub mod validation;

pub use entity::{EncryptedEntity, EntityKind};
pub use error::{Result, ShareError};
pub use types::{BatchReport, EntityId, UserId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
