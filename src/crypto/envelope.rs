//! Multi-recipient envelope encryption.
//!
//! A document is sealed once under a random [`ContentKey`]. The content key is
//! then wrapped separately for every recipient: ML-KEM-1024 encapsulation to
//! the recipient's public key, HKDF-SHA3-256 over the shared secret to derive
//! a wrapping key, and AES-256-GCM over the content key. Adding a recipient
//! only adds a wrapped key; the content ciphertext is never touched.
//!
//! Wrapped key layout: `encapsulated_key(1568) ‖ nonce(12) ‖ ciphertext+tag(48)`.

use crate::crypto::keys::{PrivateKey, PublicKey};
use crate::crypto::symmetric::{
    aead_decrypt, aead_encrypt, open, random_nonce, seal, ContentKey, CONTENT_AAD,
    CONTENT_KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Result, ShareError};
use crate::types::UserId;
use crate::validation::Validator;
use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{Ciphertext as KemCiphertext, SharedSecret as KemSharedSecret};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;
use zeroize::Zeroizing;

/// ML-KEM-1024 ciphertext size
pub const ENCAPSULATED_KEY_SIZE: usize = 1568;

/// Total size of a wrapped content key
pub const WRAPPED_KEY_SIZE: usize = ENCAPSULATED_KEY_SIZE + NONCE_SIZE + CONTENT_KEY_SIZE + TAG_SIZE;

/// HKDF salt for wrapping-key derivation
const WRAP_HKDF_SALT: &[u8] = b"pqshare-wrap-salt-v1";

/// HKDF info prefix; the encapsulated key is appended
const WRAP_HKDF_INFO: &[u8] = b"pqshare-wrap-key";

/// Associated data for wrapped content keys
const WRAPPED_KEY_AAD: &[u8] = b"pqshare-wrapped-key-v1";

/// A content key wrapped for exactly one recipient
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(#[serde(with = "hex")] Vec<u8>);

impl WrappedKey {
    /// Creates a wrapped key from raw bytes, checking the length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Validator::validate_key_size(bytes, WRAPPED_KEY_SIZE, "wrapped key")?;
        Ok(Self(bytes.to_vec()))
    }

    /// Parses a hex-encoded wrapped key
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| ShareError::validation(format!("Invalid wrapped key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the hex encoding stored in `encryptedKeys`
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Returns the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn parts(&self) -> Option<(&[u8], &[u8], &[u8])> {
        if self.0.len() != WRAPPED_KEY_SIZE {
            return None;
        }
        let (encapsulated, rest) = self.0.split_at(ENCAPSULATED_KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        Some((encapsulated, nonce, ciphertext))
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("size", &self.0.len())
            .finish()
    }
}

/// Sealed content plus one wrapped content key per recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedDocument {
    /// `nonce ‖ ciphertext+tag` of the content
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    /// Wrapped content keys, keyed by recipient
    pub encrypted_keys: BTreeMap<UserId, WrappedKey>,
}

fn derive_wrapping_key(shared_secret: &[u8], encapsulated: &[u8]) -> Option<Zeroizing<[u8; 32]>> {
    let hkdf = Hkdf::<Sha3_256>::new(Some(WRAP_HKDF_SALT), shared_secret);
    let mut info = Vec::with_capacity(WRAP_HKDF_INFO.len() + encapsulated.len());
    info.extend_from_slice(WRAP_HKDF_INFO);
    info.extend_from_slice(encapsulated);

    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, key.as_mut()).ok()?;
    Some(key)
}

/// Wraps a content key for one recipient
pub fn wrap_content_key<R: CryptoRng + RngCore>(
    content_key: &ContentKey,
    recipient: &PublicKey,
    rng: &mut R,
) -> Result<WrappedKey> {
    let public_key = recipient.as_mlkem1024()?;
    let (shared_secret, encapsulated) = mlkem1024::encapsulate(&public_key);
    let encapsulated = encapsulated.as_bytes();

    let wrapping_key = derive_wrapping_key(shared_secret.as_bytes(), encapsulated)
        .ok_or_else(|| ShareError::key_generation("HKDF expansion failed for wrapping key"))?;
    let nonce = random_nonce(rng)?;
    let ciphertext = aead_encrypt(&wrapping_key, &nonce, content_key.as_bytes(), WRAPPED_KEY_AAD)?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_SIZE);
    wrapped.extend_from_slice(encapsulated);
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&ciphertext);
    WrappedKey::from_bytes(&wrapped)
}

/// Recovers the content key from a wrapped key
///
/// Every parse or authentication failure is `DecryptionFailed`.
pub fn unwrap_content_key(wrapped: &WrappedKey, private_key: &PrivateKey) -> Result<ContentKey> {
    let (encapsulated, nonce, ciphertext) = wrapped.parts().ok_or(ShareError::DecryptionFailed)?;

    let encapsulated_key =
        mlkem1024::Ciphertext::from_bytes(encapsulated).map_err(|_| ShareError::DecryptionFailed)?;
    let secret_key = private_key.as_mlkem1024()?;
    let shared_secret = mlkem1024::decapsulate(&encapsulated_key, &secret_key);

    let wrapping_key = derive_wrapping_key(shared_secret.as_bytes(), encapsulated)
        .ok_or(ShareError::DecryptionFailed)?;
    let key_bytes = Zeroizing::new(aead_decrypt(
        &wrapping_key,
        nonce,
        ciphertext,
        WRAPPED_KEY_AAD,
    )?);

    ContentKey::from_slice(&key_bytes)
}

/// Seals content under an existing content key
pub fn encrypt_with_content_key<R: CryptoRng + RngCore>(
    plaintext: &[u8],
    content_key: &ContentKey,
    rng: &mut R,
) -> Result<Vec<u8>> {
    Validator::validate_content_size(plaintext)?;
    seal(content_key, plaintext, CONTENT_AAD, rng)
}

/// Opens content sealed by [`encrypt_with_content_key`]
pub fn decrypt_with_content_key(ciphertext: &[u8], content_key: &ContentKey) -> Result<Vec<u8>> {
    Validator::validate_ciphertext_size(ciphertext).map_err(|_| ShareError::DecryptionFailed)?;
    open(content_key, ciphertext, CONTENT_AAD)
}

/// Wraps one content key for every recipient
pub fn wrap_for_recipients<R: CryptoRng + RngCore>(
    content_key: &ContentKey,
    recipients: &BTreeMap<UserId, PublicKey>,
    rng: &mut R,
) -> Result<BTreeMap<UserId, WrappedKey>> {
    if recipients.is_empty() {
        return Err(ShareError::EmptyRecipientSet);
    }

    recipients
        .iter()
        .map(|(uid, public_key)| {
            trace!(uid = %uid, "Wrapping content key");
            Ok((uid.clone(), wrap_content_key(content_key, public_key, rng)?))
        })
        .collect()
}

/// Encrypts a document for a set of recipients under one fresh content key
pub fn encrypt_for_recipients<R: CryptoRng + RngCore>(
    plaintext: &[u8],
    recipients: &BTreeMap<UserId, PublicKey>,
    rng: &mut R,
) -> Result<EncryptedDocument> {
    if recipients.is_empty() {
        return Err(ShareError::EmptyRecipientSet);
    }

    let content_key = ContentKey::generate(rng)?;
    let ciphertext = encrypt_with_content_key(plaintext, &content_key, rng)?;
    let encrypted_keys = wrap_for_recipients(&content_key, recipients, rng)?;

    Ok(EncryptedDocument {
        ciphertext,
        encrypted_keys,
    })
}

/// Decrypts a document with the caller's wrapped key and private key
pub fn decrypt(ciphertext: &[u8], wrapped: &WrappedKey, private_key: &PrivateKey) -> Result<Vec<u8>> {
    let content_key = unwrap_content_key(wrapped, private_key)?;
    decrypt_with_content_key(ciphertext, &content_key)
}

/// Re-wraps a content key for a new recipient without touching the content
pub fn rewrap_content_key<R: CryptoRng + RngCore>(
    existing: &WrappedKey,
    existing_private_key: &PrivateKey,
    new_recipient: &PublicKey,
    rng: &mut R,
) -> Result<WrappedKey> {
    let content_key = unwrap_content_key(existing, existing_private_key)?;
    wrap_content_key(&content_key, new_recipient, rng)
}
