//! Post-quantum cryptographic primitives for pqshare.
//!
//! This module provides the core cryptographic operations:
//!
//! - **ML-KEM-1024**: Module-Lattice-Based Key-Encapsulation Mechanism for wrapping content keys
//! - **AES-256-GCM**: Symmetric encryption for content, metadata and wrapped keys
//! - **Argon2id**: Passphrase-based protection of private keys at rest
//! - **SHA3**: Quantum-resistant hashing and HKDF

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

pub mod envelope;
pub mod keys;
pub mod password;
pub mod symmetric;
pub mod timing;

pub use envelope::{
    decrypt, decrypt_with_content_key, encrypt_for_recipients, encrypt_with_content_key,
    rewrap_content_key, unwrap_content_key, wrap_content_key, wrap_for_recipients,
    EncryptedDocument, WrappedKey,
};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use password::{unwrap_private_key, wrap_private_key, KdfParams, Passphrase, WrappedPrivateKey};
pub use symmetric::ContentKey;
pub use timing::{TimingSafe, TimingSafeError};

/// Algorithm identifiers used by pqshare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// ML-KEM-1024 for key encapsulation (NIST standardized)
    Mlkem1024 = 100,
    /// AES-256-GCM for symmetric encryption
    Aes256Gcm = 102,
    /// SHA3-256 for hashing
    Sha3_256 = 103,
}

impl Algorithm {
    /// Returns the algorithm name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Mlkem1024 => "ML-KEM-1024",
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::Sha3_256 => "SHA3-256",
        }
    }

    /// Returns the key size in bytes for this algorithm
    pub fn key_size(&self) -> usize {
        match self {
            Algorithm::Mlkem1024 => keys::PUBLIC_KEY_SIZE,
            Algorithm::Aes256Gcm => symmetric::CONTENT_KEY_SIZE,
            Algorithm::Sha3_256 => 32,
        }
    }

    /// Returns true if this is a post-quantum algorithm
    pub fn is_post_quantum(&self) -> bool {
        matches!(self, Algorithm::Mlkem1024)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Cryptographic hash function using SHA3-256
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}
