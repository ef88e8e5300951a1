//! Error types for pqshare operations.

use thiserror::Error;

/// Result type alias for pqshare operations.
pub type Result<T> = std::result::Result<T, ShareError>;

/// Main error type for pqshare operations.
///
/// The crypto-facing variants (`InvalidPassphrase`, `DecryptionFailed`) carry no
/// detail on purpose: callers must not be able to tell which layer rejected
/// the input.
#[derive(Error, Debug)]
pub enum ShareError {
    /// Key pair generation failed (RNG or algorithm failure)
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// Passphrase-wrapped private key could not be opened
    #[error("Invalid passphrase or corrupted key material")]
    InvalidPassphrase,

    /// Recipient has no published public key
    #[error("No public key published for user {uid}")]
    MissingPublicKey { uid: String },

    /// AEAD authentication failed somewhere in the decrypt path
    #[error("Decryption failed")]
    DecryptionFailed,

    /// A document must always have at least one recipient
    #[error("Recipient set is empty")]
    EmptyRecipientSet,

    /// Atomic update lost a race against another writer
    #[error("Concurrent modification of entity {entity_id}")]
    ConcurrentModification { entity_id: String },

    /// Post-migration round-trip check failed
    #[error("Migration verification failed: {0}")]
    MigrationVerification(String),

    /// The entity carries no wrapped key for this user
    #[error("No wrapped key for user {uid} on entity {entity_id}")]
    NoWrappedKey { entity_id: String, uid: String },

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An entity failed its recipient-set invariants
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backing store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation was cancelled between items
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShareError {
    /// Creates a new key generation error.
    pub fn key_generation<T: ToString>(msg: T) -> Self {
        Self::KeyGeneration(msg.to_string())
    }

    /// Creates a new missing public key error.
    pub fn missing_public_key<T: ToString>(uid: T) -> Self {
        Self::MissingPublicKey {
            uid: uid.to_string(),
        }
    }

    /// Creates a new concurrent modification error.
    pub fn concurrent_modification<T: ToString>(entity_id: T) -> Self {
        Self::ConcurrentModification {
            entity_id: entity_id.to_string(),
        }
    }

    /// Creates a new migration verification error.
    pub fn migration_verification<T: ToString>(msg: T) -> Self {
        Self::MigrationVerification(msg.to_string())
    }

    /// Creates a new missing wrapped key error.
    pub fn no_wrapped_key<E: ToString, U: ToString>(entity_id: E, uid: U) -> Self {
        Self::NoWrappedKey {
            entity_id: entity_id.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Creates a new not found error.
    pub fn not_found<T: ToString>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Creates a new permission error.
    pub fn permission_denied<T: ToString>(msg: T) -> Self {
        Self::PermissionDenied(msg.to_string())
    }

    /// Creates a new invariant violation error.
    pub fn invariant<T: ToString>(msg: T) -> Self {
        Self::InvariantViolation(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Returns true for transient conflicts the caller may retry with a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. } | Self::Storage(_))
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_errors_carry_no_detail() {
        assert_eq!(ShareError::DecryptionFailed.to_string(), "Decryption failed");
        assert_eq!(
            ShareError::InvalidPassphrase.to_string(),
            "Invalid passphrase or corrupted key material"
        );
    }

    #[test]
    fn test_no_wrapped_key_is_distinct() {
        let err = ShareError::no_wrapped_key("doc-1", "bob");
        assert!(!matches!(err, ShareError::DecryptionFailed));
        assert!(err.to_string().contains("bob"));
        assert!(err.to_string().contains("doc-1"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ShareError::concurrent_modification("x").is_retryable());
        assert!(!ShareError::DecryptionFailed.is_retryable());
        assert!(!ShareError::missing_public_key("bob").is_retryable());
    }
}
