//! Encrypted entity metadata (name and size).
//!
//! Metadata fields are sealed under the entity's content key, each with its own
//! nonce, and stored inline on the record. Older records may still carry
//! plaintext fields; those deserialize as [`FieldValue::Plaintext`] and are
//! only converted through [`upgrade_legacy_metadata`].

use crate::crypto::envelope::{unwrap_content_key, WrappedKey};
use crate::crypto::keys::PrivateKey;
use crate::crypto::symmetric::{open_detached, seal_detached, ContentKey};
use crate::entity::EncryptedEntity;
use crate::error::{Result, ShareError};
use crate::validation::Validator;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An AEAD-sealed metadata field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
}

/// A metadata field as persisted: legacy plaintext or encrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Legacy plaintext value
    Plaintext(String),
    /// `{ciphertext, nonce}` sealed under the content key
    Encrypted(EncryptedField),
}

impl FieldValue {
    /// Returns true for the encrypted representation
    pub fn is_encrypted(&self) -> bool {
        matches!(self, FieldValue::Encrypted(_))
    }
}

/// Identifies a metadata field; the name is bound as associated data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Name,
    Size,
}

impl MetadataField {
    fn aad(&self) -> &'static [u8] {
        match self {
            MetadataField::Name => b"pqshare-metadata-v1:name",
            MetadataField::Size => b"pqshare-metadata-v1:size",
        }
    }
}

/// Decrypted metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub size: Option<u64>,
    /// Size text that is not a byte count (older clients wrote values such
    /// as `"1.2 MB"`), carried verbatim instead of failing the record
    pub unparsed_size: Option<String>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            size,
            unparsed_size: None,
        }
    }

    /// The size field as it is persisted
    fn size_text(&self) -> Option<String> {
        self.size
            .map(|size| size.to_string())
            .or_else(|| self.unparsed_size.clone())
    }
}

/// Encrypts one field under the content key
pub fn encrypt_field<R: CryptoRng + RngCore>(
    value: &str,
    field: MetadataField,
    content_key: &ContentKey,
    rng: &mut R,
) -> Result<FieldValue> {
    Validator::validate_metadata_field(value)?;
    let (nonce, ciphertext) = seal_detached(content_key, value.as_bytes(), field.aad(), rng)?;
    Ok(FieldValue::Encrypted(EncryptedField { ciphertext, nonce }))
}

/// Decodes one field, decrypting it when encrypted
pub fn decrypt_field(
    value: &FieldValue,
    field: MetadataField,
    content_key: &ContentKey,
) -> Result<String> {
    match value {
        FieldValue::Plaintext(text) => Ok(text.clone()),
        FieldValue::Encrypted(sealed) => {
            let bytes = open_detached(content_key, &sealed.nonce, &sealed.ciphertext, field.aad())?;
            String::from_utf8(bytes)
                .map_err(|_| ShareError::serialization("Decrypted metadata is not UTF-8"))
        }
    }
}

/// Encrypts name and size, returning the persisted `(name, size)` fields
pub fn encrypt_metadata<R: CryptoRng + RngCore>(
    metadata: &Metadata,
    content_key: &ContentKey,
    rng: &mut R,
) -> Result<(FieldValue, Option<FieldValue>)> {
    let name = encrypt_field(&metadata.name, MetadataField::Name, content_key, rng)?;
    let size = metadata
        .size_text()
        .map(|size| encrypt_field(&size, MetadataField::Size, content_key, rng))
        .transpose()?;
    Ok((name, size))
}

/// Decrypts an entity's metadata with an already-recovered content key
pub fn decrypt_metadata_with_key(entity: &EncryptedEntity, content_key: &ContentKey) -> Result<Metadata> {
    let mut metadata = Metadata::new(decrypt_field(&entity.name, MetadataField::Name, content_key)?, None);
    if let Some(value) = &entity.size {
        let text = decrypt_field(value, MetadataField::Size, content_key)?;
        match text.trim().parse::<u64>() {
            Ok(size) => metadata.size = Some(size),
            Err(_) => {
                debug!(entity_id = %entity.id, "Size field is not a byte count, keeping it verbatim");
                metadata.unparsed_size = Some(text);
            }
        }
    }
    Ok(metadata)
}

/// Decrypts an entity's metadata with the caller's wrapped key and private key
pub fn decrypt_metadata(
    entity: &EncryptedEntity,
    wrapped_key: &WrappedKey,
    private_key: &PrivateKey,
) -> Result<Metadata> {
    let content_key = unwrap_content_key(wrapped_key, private_key)?;
    decrypt_metadata_with_key(entity, &content_key)
}

/// Converts plaintext metadata fields to their encrypted form
///
/// Fields that are already encrypted are authenticated first, so a wrong
/// content key cannot produce a record with mixed keys. Returns whether the
/// entity changed.
pub fn upgrade_legacy_metadata<R: CryptoRng + RngCore>(
    entity: &mut EncryptedEntity,
    content_key: &ContentKey,
    rng: &mut R,
) -> Result<bool> {
    // Authenticates any field that is already encrypted
    let metadata = decrypt_metadata_with_key(entity, content_key)?;
    let legacy_name = !entity.name.is_encrypted();
    let legacy_size = entity.size.as_ref().is_some_and(|size| !size.is_encrypted());

    if !legacy_name && !legacy_size {
        return Ok(false);
    }

    if legacy_name {
        entity.name = encrypt_field(&metadata.name, MetadataField::Name, content_key, rng)?;
    }
    if legacy_size {
        if let Some(FieldValue::Plaintext(text)) = entity.size.clone() {
            entity.size = Some(encrypt_field(&text, MetadataField::Size, content_key, rng)?);
        }
    }

    debug!(entity_id = %entity.id, legacy_name, legacy_size, "Upgraded legacy metadata");
    Ok(true)
}
