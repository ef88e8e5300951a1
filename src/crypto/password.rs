//! Passphrase-based private key protection using Argon2id and AES-GCM.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::keys::PrivateKey;
use crate::crypto::symmetric::NONCE_SIZE;
use crate::crypto::timing::TimingSafeError;
use crate::error::{Result, ShareError};

/// Salt size for Argon2 (128 bits)
pub const SALT_SIZE: usize = 16;

/// Associated data binding the ciphertext to its purpose
const PRIVATE_KEY_AAD: &[u8] = b"pqshare-private-key-v1";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024, // 19 MiB memory cost
            iterations: 2,
            lanes: 1,
        }
    }
}

impl KdfParams {
    /// Converts to Argon2 parameters, rejecting values Argon2 refuses
    pub fn to_argon2(&self) -> Result<argon2::Params> {
        argon2::Params::new(self.memory_kib, self.iterations, self.lanes, Some(32))
            .map_err(|e| ShareError::config(format!("Invalid Argon2 parameters: {}", e)))
    }
}

/// Passphrase for private key wrapping
pub struct Passphrase(String);

impl Passphrase {
    /// Create a new passphrase from a string
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(passphrase.into())
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Check if passphrase is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// A private key encrypted under a passphrase-derived key
///
/// This is the only form in which a private key is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedPrivateKey {
    /// AES-GCM ciphertext of the private key, including the tag
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    /// Argon2 salt
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    /// AES-GCM nonce
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
    /// Argon2 cost the key was wrapped with
    #[serde(default)]
    pub kdf: KdfParams,
}

/// Encrypts a private key under a passphrase
///
/// A fresh salt and nonce are drawn for every call.
pub fn wrap_private_key(
    private_key: &PrivateKey,
    passphrase: &Passphrase,
    params: &KdfParams,
) -> Result<WrappedPrivateKey> {
    if passphrase.is_empty() {
        return Err(ShareError::InvalidPassphrase);
    }

    let mut salt = vec![0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| ShareError::key_generation(format!("RNG failure: {}", e)))?;
    let mut nonce = vec![0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| ShareError::key_generation(format!("RNG failure: {}", e)))?;

    let derived_key = derive_key_from_passphrase(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(derived_key.as_slice()));

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: private_key.as_bytes(),
                aad: PRIVATE_KEY_AAD,
            },
        )
        .map_err(|_| ShareError::key_generation("Failed to encrypt private key"))?;

    debug!(
        memory_kib = params.memory_kib,
        iterations = params.iterations,
        "Wrapped private key under passphrase"
    );

    Ok(WrappedPrivateKey {
        ciphertext,
        salt,
        nonce,
        kdf: *params,
    })
}

/// Decrypts a passphrase-wrapped private key
///
/// Every failure (wrong passphrase, tampered ciphertext, malformed salt or
/// nonce) surfaces as the same `InvalidPassphrase` after the same minimum
/// duration.
pub fn unwrap_private_key(wrapped: &WrappedPrivateKey, passphrase: &Passphrase) -> Result<PrivateKey> {
    TimingSafeError::validate_with_timing(|| {
        let params_ok = wrapped.kdf.to_argon2().is_ok();
        if passphrase.is_empty()
            || wrapped.salt.len() != SALT_SIZE
            || wrapped.nonce.len() != NONCE_SIZE
            || !params_ok
        {
            // Pay for a full derivation so a malformed blob fails no faster
            // than a wrong passphrase
            let fallback = KdfParams::default();
            let params = if params_ok { &wrapped.kdf } else { &fallback };
            let _ = derive_key_from_passphrase(passphrase, &[0u8; SALT_SIZE], params);
            return Err(ShareError::InvalidPassphrase);
        }

        let derived_key = derive_key_from_passphrase(passphrase, &wrapped.salt, &wrapped.kdf)
            .map_err(|_| ShareError::InvalidPassphrase)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(derived_key.as_slice()));

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&wrapped.nonce),
                    Payload {
                        msg: &wrapped.ciphertext,
                        aad: PRIVATE_KEY_AAD,
                    },
                )
                .map_err(|_| ShareError::InvalidPassphrase)?,
        );

        PrivateKey::from_bytes(&plaintext).map_err(|_| ShareError::InvalidPassphrase)
    })
}

/// Derive a 256-bit key from a passphrase using Argon2id
fn derive_key_from_passphrase(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>> {
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params.to_argon2()?,
    );

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| ShareError::config(format!("Passphrase derivation failed: {}", e)))?;
    Ok(key)
}
