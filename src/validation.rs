//! Input validation and security limits for pqshare
//!
//! This module provides validation functions and limits that guard the crypto
//! and storage layers against oversized or malformed input before any
//! expensive operation runs.

use crate::error::{Result, ShareError};

/// Maximum allowed plaintext content size (100MB)
///
/// Larger files should be chunked by the caller before encryption.
pub const MAX_CONTENT_SIZE: usize = 100 * 1024 * 1024;

/// Maximum allowed content ciphertext size (nonce + content + tag)
pub const MAX_CIPHERTEXT_SIZE: usize = MAX_CONTENT_SIZE + 12 + 16;

/// Maximum allowed metadata field length (4KB)
pub const MAX_METADATA_FIELD_SIZE: usize = 4 * 1024;

/// Maximum allowed user ID length
pub const MAX_USER_ID_LENGTH: usize = 128;

/// Maximum allowed entity ID length
pub const MAX_ENTITY_ID_LENGTH: usize = 128;

/// Maximum allowed page size for store queries
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Validation functions for input data
pub struct Validator;

impl Validator {
    /// Validate plaintext content size
    pub fn validate_content_size(data: &[u8]) -> Result<()> {
        if data.len() > MAX_CONTENT_SIZE {
            return Err(ShareError::validation(format!(
                "Content too large: {} bytes exceeds maximum of {} bytes",
                data.len(),
                MAX_CONTENT_SIZE
            )));
        }
        Ok(())
    }

    /// Validate content ciphertext size
    pub fn validate_ciphertext_size(data: &[u8]) -> Result<()> {
        if data.len() > MAX_CIPHERTEXT_SIZE {
            return Err(ShareError::validation(format!(
                "Ciphertext too large: {} bytes exceeds maximum of {} bytes",
                data.len(),
                MAX_CIPHERTEXT_SIZE
            )));
        }
        Ok(())
    }

    /// Validate a plaintext metadata field
    pub fn validate_metadata_field(value: &str) -> Result<()> {
        if value.len() > MAX_METADATA_FIELD_SIZE {
            return Err(ShareError::validation(format!(
                "Metadata field too long: {} bytes exceeds maximum of {} bytes",
                value.len(),
                MAX_METADATA_FIELD_SIZE
            )));
        }
        Ok(())
    }

    /// Validate key material has the exact size the algorithm requires
    pub fn validate_key_size(data: &[u8], expected_size: usize, what: &str) -> Result<()> {
        if data.len() != expected_size {
            return Err(ShareError::validation(format!(
                "Invalid {} size: expected {} bytes, got {} bytes",
                what,
                expected_size,
                data.len()
            )));
        }
        Ok(())
    }

    /// Validate user ID string
    ///
    /// `:` is reserved as the separator in storage index keys.
    pub fn validate_user_id(user_id: &str) -> Result<()> {
        if user_id.len() > MAX_USER_ID_LENGTH {
            return Err(ShareError::validation(format!(
                "User ID too long: {} bytes exceeds maximum of {} bytes",
                user_id.len(),
                MAX_USER_ID_LENGTH
            )));
        }

        if user_id.trim().is_empty() {
            return Err(ShareError::validation("User ID cannot be empty"));
        }

        if user_id.chars().any(|c| c.is_control()) {
            return Err(ShareError::validation(
                "User ID contains invalid control characters",
            ));
        }

        if user_id.contains(':') {
            return Err(ShareError::validation("User ID cannot contain ':'"));
        }

        Ok(())
    }

    /// Validate entity ID string
    pub fn validate_entity_id(entity_id: &str) -> Result<()> {
        if entity_id.is_empty() {
            return Err(ShareError::validation("Entity ID cannot be empty"));
        }

        if entity_id.len() > MAX_ENTITY_ID_LENGTH {
            return Err(ShareError::validation(format!(
                "Entity ID too long: {} bytes exceeds maximum of {} bytes",
                entity_id.len(),
                MAX_ENTITY_ID_LENGTH
            )));
        }

        if !entity_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ShareError::validation(
                "Entity ID may only contain ASCII letters, digits, '-' and '_'",
            ));
        }

        Ok(())
    }

    /// Validate a query page size
    pub fn validate_page_size(size: usize) -> Result<()> {
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(ShareError::validation(format!(
                "Invalid page size {}: must be between 1 and {}",
                size, MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Validate nonce size for cryptographic operations
    pub fn validate_nonce_size(nonce: &[u8], expected_size: usize) -> Result<()> {
        if nonce.len() != expected_size {
            return Err(ShareError::validation(format!(
                "Invalid nonce size: expected {} bytes, got {} bytes",
                expected_size,
                nonce.len()
            )));
        }
        Ok(())
    }
}
