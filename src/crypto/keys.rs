//! Post-quantum key generation and management.
//!
//! This module implements ML-KEM-1024 key pairs. Public keys are published in
//! the clear on a user's profile; private keys only ever leave memory wrapped
//! under a passphrase (see [`crate::crypto::password`]).

use crate::crypto::timing::TimingSafe;
use crate::crypto::{hash_data, Algorithm};
use crate::error::{Result, ShareError};
use crate::validation::Validator;
use pqcrypto_mlkem::mlkem1024::{
    self, PublicKey as Mlkem1024PublicKey, SecretKey as Mlkem1024SecretKey,
};
use pqcrypto_traits::kem::{PublicKey as KemPublicKey, SecretKey as KemSecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// ML-KEM-1024 public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 1568;

/// ML-KEM-1024 secret key size in bytes
pub const PRIVATE_KEY_SIZE: usize = 3168;

/// Offset of the embedded encapsulation key inside an ML-KEM-1024 secret key
const EMBEDDED_PUBLIC_KEY_OFFSET: usize = 1536;

/// An ML-KEM-1024 public key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Serialized key bytes
    #[serde(with = "hex")]
    pub(crate) key_bytes: Vec<u8>,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &Algorithm::Mlkem1024)
            .field("fingerprint", &self.fingerprint_hex())
            .finish()
    }
}

/// An ML-KEM-1024 private key
///
/// The key bytes are wiped when the handle is dropped. The type is neither
/// `Clone` nor `Serialize`: persist it through
/// [`wrap_private_key`](crate::crypto::password::wrap_private_key) only.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    key_bytes: Vec<u8>,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &Algorithm::Mlkem1024)
            .field("key_size", &self.key_bytes.len())
            .finish()
    }
}

/// A complete key pair containing both public and private keys
pub struct KeyPair {
    /// The public key component
    pub public: PublicKey,
    /// The private key component
    pub private: PrivateKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &Algorithm::Mlkem1024)
            .field("fingerprint", &self.public.fingerprint_hex())
            .finish()
    }
}

impl PublicKey {
    /// Creates a public key from raw bytes, checking the length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Validator::validate_key_size(bytes, PUBLIC_KEY_SIZE, "public key")?;
        Ok(Self {
            key_bytes: bytes.to_vec(),
        })
    }

    /// Parses a hex-encoded public key
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| ShareError::validation(format!("Invalid public key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    /// Returns the hex encoding of the key
    pub fn to_hex(&self) -> String {
        hex::encode(&self.key_bytes)
    }

    /// Computes the fingerprint of this public key using SHA3-256
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut data = Vec::with_capacity(1 + self.key_bytes.len());
        data.push(Algorithm::Mlkem1024 as u8);
        data.extend_from_slice(&self.key_bytes);
        hash_data(&data)
    }

    /// Returns the first 8 bytes of the fingerprint as hex, for display
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.fingerprint()[..8])
    }

    /// Returns the ML-KEM-1024 public key
    pub(crate) fn as_mlkem1024(&self) -> Result<Mlkem1024PublicKey> {
        Mlkem1024PublicKey::from_bytes(&self.key_bytes)
            .map_err(|_| ShareError::validation("Malformed ML-KEM-1024 public key"))
    }
}

impl PrivateKey {
    /// Creates a private key from raw bytes, checking the length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Validator::validate_key_size(bytes, PRIVATE_KEY_SIZE, "private key")?;
        Ok(Self {
            key_bytes: bytes.to_vec(),
        })
    }

    /// Returns the raw key bytes
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    /// Returns the public key embedded in the ML-KEM-1024 secret key
    pub fn public_key(&self) -> Result<PublicKey> {
        let end = EMBEDDED_PUBLIC_KEY_OFFSET + PUBLIC_KEY_SIZE;
        let embedded = self
            .key_bytes
            .get(EMBEDDED_PUBLIC_KEY_OFFSET..end)
            .ok_or_else(|| ShareError::validation("Private key too short"))?;
        PublicKey::from_bytes(embedded)
    }

    /// Returns the ML-KEM-1024 secret key
    pub(crate) fn as_mlkem1024(&self) -> Result<Mlkem1024SecretKey> {
        Mlkem1024SecretKey::from_bytes(&self.key_bytes)
            .map_err(|_| ShareError::DecryptionFailed)
    }
}

impl KeyPair {
    /// Generates a new ML-KEM-1024 key pair
    ///
    /// `mlkem1024::keypair()` draws from the system CSPRNG internally.
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = mlkem1024::keypair();

        let public_bytes = KemPublicKey::as_bytes(&public_key);
        let secret_bytes = KemSecretKey::as_bytes(&secret_key);

        if public_bytes.len() != PUBLIC_KEY_SIZE {
            return Err(ShareError::key_generation(format!(
                "ML-KEM-1024 produced a {}-byte public key",
                public_bytes.len()
            )));
        }
        if secret_bytes.len() != PRIVATE_KEY_SIZE {
            return Err(ShareError::key_generation(format!(
                "ML-KEM-1024 produced a {}-byte private key",
                secret_bytes.len()
            )));
        }

        let keypair = Self {
            public: PublicKey {
                key_bytes: public_bytes.to_vec(),
            },
            private: PrivateKey {
                key_bytes: secret_bytes.to_vec(),
            },
        };

        if !keypair.is_valid() {
            return Err(ShareError::key_generation(
                "Generated private key does not embed its public key",
            ));
        }

        Ok(keypair)
    }

    /// Rebuilds a pair from a private key and the public key it embeds
    pub fn from_private_key(private: PrivateKey) -> Result<Self> {
        let public = private.public_key()?;
        Ok(Self { public, private })
    }

    /// Returns the public key component
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the private key component
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Splits the pair into its halves
    pub fn into_parts(self) -> (PublicKey, PrivateKey) {
        (self.public, self.private)
    }

    /// Checks that the private key embeds this public key
    pub fn is_valid(&self) -> bool {
        match self.private.public_key() {
            Ok(embedded) => TimingSafe::bytes_equal(embedded.as_bytes(), self.public.as_bytes()),
            Err(_) => false,
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PublicKey({}, FP: {})",
            Algorithm::Mlkem1024,
            self.fingerprint_hex()
        )
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KeyPair({}, FP: {})",
            Algorithm::Mlkem1024,
            self.public.fingerprint_hex()
        )
    }
}
