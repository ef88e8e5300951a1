//! Content keys and AES-256-GCM sealing.
//!
//! Every ciphertext produced here is bound to a domain label through the AEAD
//! associated data, so content, metadata fields and wrapped keys cannot be
//! swapped for one another without failing authentication.

use crate::error::{Result, ShareError};
use crate::validation::Validator;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Content key size (AES-256)
pub const CONTENT_KEY_SIZE: usize = 32;

/// AES-GCM nonce size
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Associated data for document content
pub const CONTENT_AAD: &[u8] = b"pqshare-content-v1";

/// A random per-document symmetric key
///
/// Never persisted unwrapped; wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; CONTENT_KEY_SIZE]);

impl ContentKey {
    /// Generates a fresh random content key
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Result<Self> {
        let mut key = [0u8; CONTENT_KEY_SIZE];
        rng.try_fill_bytes(&mut key)
            .map_err(|e| ShareError::key_generation(format!("RNG failure: {}", e)))?;
        Ok(Self(key))
    }

    /// Rebuilds a content key from unwrapped bytes
    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; CONTENT_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| ShareError::DecryptionFailed)?;
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; CONTENT_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

/// Draws a fresh random nonce
pub(crate) fn random_nonce<R: CryptoRng + RngCore>(rng: &mut R) -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.try_fill_bytes(&mut nonce)
        .map_err(|e| ShareError::key_generation(format!("RNG failure: {}", e)))?;
    Ok(nonce)
}

/// AES-256-GCM encryption under a raw key
pub(crate) fn aead_encrypt(
    key: &[u8; CONTENT_KEY_SIZE],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    Validator::validate_nonce_size(nonce, NONCE_SIZE)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ShareError::validation("AES-GCM encryption failed"))
}

/// AES-256-GCM decryption under a raw key
///
/// Any failure, including a malformed nonce, is `DecryptionFailed`.
pub(crate) fn aead_decrypt(
    key: &[u8; CONTENT_KEY_SIZE],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE || ciphertext.len() < TAG_SIZE {
        return Err(ShareError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ShareError::DecryptionFailed)
}

/// Encrypts under a content key, returning `(nonce, ciphertext)` separately
pub fn seal_detached<R: CryptoRng + RngCore>(
    key: &ContentKey,
    plaintext: &[u8],
    aad: &[u8],
    rng: &mut R,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let nonce = random_nonce(rng)?;
    let ciphertext = aead_encrypt(key.as_bytes(), &nonce, plaintext, aad)?;
    Ok((nonce.to_vec(), ciphertext))
}

/// Decrypts a detached `(nonce, ciphertext)` pair
pub fn open_detached(key: &ContentKey, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    aead_decrypt(key.as_bytes(), nonce, ciphertext, aad)
}

/// Encrypts under a content key, returning `nonce ‖ ciphertext`
pub fn seal<R: CryptoRng + RngCore>(
    key: &ContentKey,
    plaintext: &[u8],
    aad: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    let (mut sealed, ciphertext) = seal_detached(key, plaintext, aad, rng)?;
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts `nonce ‖ ciphertext`
pub fn open(key: &ContentKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ShareError::DecryptionFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    open_detached(key, nonce, ciphertext, aad)
}
