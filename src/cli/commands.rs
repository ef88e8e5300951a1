//! Command implementations for the pqshare CLI.

use crate::{
    cli::utils::{
        format_timestamp, prompt_for_new_passphrase, prompt_for_passphrase, read_file,
        write_file, Session,
    },
    crypto::{password::wrap_private_key, KeyPair},
    migration::{unlock_pending_key_pair, CancellationToken, MigrationRequest},
    sharing::NewEntity,
    types::{EntityId, UserId},
    Result, ShareError,
};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

fn unlock(session: &Session, uid: &UserId) -> Result<crate::crypto::PrivateKey> {
    let passphrase = prompt_for_passphrase(&format!("Passphrase for {}", uid))?;
    session.sharing.unlock_private_key(uid, &passphrase)
}

/// Execute keygen command
pub fn keygen(session: &Session, uid: &UserId) -> Result<()> {
    info!(uid = %uid, "Generating key pair");

    let passphrase = prompt_for_new_passphrase("Enter passphrase to protect private key")?;
    let key_pair = session
        .sharing
        .enroll_user(uid, &passphrase, &session.config.kdf)?;

    info!(
        uid = %uid,
        fingerprint = %key_pair.public_key().fingerprint_hex(),
        public_key_size = key_pair.public_key().as_bytes().len(),
        "✅ Generated and published key pair"
    );
    Ok(())
}

/// Execute put command
pub fn put(session: &Session, uid: &UserId, file: &Path, parent: Option<EntityId>) -> Result<()> {
    let public_key = session.sharing.public_key_for(uid)?;
    let content = read_file(file)?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ShareError::validation(format!("{} has no file name", file.display())))?;

    info!(uid = %uid, file = %file.display(), bytes = content.len(), "Encrypting file");

    let mut request = NewEntity::file(uid, &public_key, &name, &content);
    if let Some(parent) = parent {
        request = request.with_parent(parent);
    }
    let entity = session.sharing.create_entity(request)?;

    info!(entity_id = %entity.id, "✅ File stored");
    println!("{}", entity.id);
    Ok(())
}

/// Execute mkdir command
pub fn mkdir(session: &Session, uid: &UserId, name: &str, parent: Option<EntityId>) -> Result<()> {
    let public_key = session.sharing.public_key_for(uid)?;

    let mut request = NewEntity::folder(uid, &public_key, name);
    if let Some(parent) = parent {
        request = request.with_parent(parent);
    }
    let entity = session.sharing.create_entity(request)?;

    info!(entity_id = %entity.id, "✅ Folder created");
    println!("{}", entity.id);
    Ok(())
}

/// Execute ls command
pub fn ls(session: &Session, uid: &UserId) -> Result<()> {
    let private_key = unlock(session, uid)?;
    let entities = session.sharing.list_accessible(uid)?;

    if entities.is_empty() {
        info!(uid = %uid, "No accessible entities");
        return Ok(());
    }

    for entity in &entities {
        match session
            .sharing
            .read_metadata(&entity.id, uid, &private_key)
        {
            Ok(metadata) => info!(
                entity_id = %entity.id,
                kind = %entity.kind,
                name = %metadata.name,
                size = ?metadata.size,
                unparsed_size = ?metadata.unparsed_size,
                owner = %entity.owner,
                shared_with = entity.shared_with.len(),
                updated = ?entity.updated_at.map(format_timestamp),
                "Entity"
            ),
            Err(e) => warn!(entity_id = %entity.id, error = %e, "Metadata could not be decrypted"),
        }
    }
    Ok(())
}

/// Execute cat command
pub fn cat(session: &Session, uid: &UserId, entity: &EntityId, output: Option<&Path>) -> Result<()> {
    let private_key = unlock(session, uid)?;
    let content = session.sharing.read_content(entity, uid, &private_key)?;

    match output {
        Some(path) => {
            write_file(path, &content)?;
            info!(entity_id = %entity, file = %path.display(), "✅ Content decrypted");
        }
        None => std::io::stdout().write_all(&content)?,
    }
    Ok(())
}

/// Execute share command
pub fn share(session: &Session, uid: &UserId, entity: &EntityId, recipient: &UserId) -> Result<()> {
    let private_key = unlock(session, uid)?;
    let stored = session
        .sharing
        .grant_access(entity, uid, &private_key, recipient)?;

    info!(
        entity_id = %entity,
        recipient = %recipient,
        recipients = stored.shared_with.len(),
        "✅ Access granted"
    );
    Ok(())
}

/// Execute revoke command
pub fn revoke(session: &Session, uid: &UserId, entity: &EntityId, recipient: &UserId) -> Result<()> {
    session.sharing.revoke_access(entity, uid, recipient)?;
    info!(entity_id = %entity, recipient = %recipient, "✅ Access revoked");
    Ok(())
}

/// Execute rm command
pub fn rm(session: &Session, uid: &UserId, entity: &EntityId) -> Result<()> {
    session.sharing.delete_entity(entity, uid)?;
    info!(entity_id = %entity, "✅ Entity deleted");
    Ok(())
}

/// Execute rotate-key command
pub fn rotate_key(session: &Session, uid: &UserId, entity: &EntityId) -> Result<()> {
    let private_key = unlock(session, uid)?;
    let stored = session
        .sharing
        .rotate_content_key(entity, uid, &private_key)?;
    info!(
        entity_id = %entity,
        recipients = stored.shared_with.len(),
        "✅ Content key rotated"
    );
    Ok(())
}

/// Execute migrate command
pub fn migrate(session: &Session, uid: &UserId) -> Result<()> {
    let old_private_key = unlock(session, uid)?;
    let service = session.migration();

    // An unfinished run left its key pair staged; entities it migrated open
    // only under that pair, so it must be reused rather than replaced
    let pending = service
        .pending_key_pair(uid)?
        .filter(|p| old_private_key.public_key().map_or(true, |current| current != p.public_key));

    let (new_key_pair, wrapped) = match pending {
        Some(pending) => {
            info!(
                uid = %uid,
                fingerprint = %pending.public_key.fingerprint_hex(),
                "Resuming unfinished key migration"
            );
            let passphrase = prompt_for_passphrase("Passphrase of the pending private key")?;
            let key_pair = unlock_pending_key_pair(&pending, &passphrase)?;
            (key_pair, pending.wrapped_private_key)
        }
        None => {
            let passphrase = prompt_for_new_passphrase("Enter passphrase for the new private key")?;
            let key_pair = KeyPair::generate()?;
            let wrapped = wrap_private_key(key_pair.private_key(), &passphrase, &session.config.kdf)?;
            (key_pair, wrapped)
        }
    };

    let request = MigrationRequest {
        uid,
        old_private_key: &old_private_key,
        new_key_pair: &new_key_pair,
        new_wrapped_private_key: Some(&wrapped),
        only: None,
    };
    let report = service.migrate(&request, &CancellationToken::new())?;

    for (id, error) in &report.failed {
        warn!(entity_id = %id, error = %error, "Entity not migrated");
    }
    if let Some(error) = &report.verification_error {
        warn!(error = %error, "Verification failed");
    }

    if report.is_success() {
        info!(
            uid = %uid,
            migrated = report.succeeded.len(),
            fingerprint = %new_key_pair.public_key().fingerprint_hex(),
            "✅ Key migration complete"
        );
        Ok(())
    } else {
        Err(ShareError::migration_verification(format!(
            "migration ended {} with {} failed entities; run migrate again to resume with the staged key pair",
            report.state,
            report.failed.len()
        )))
    }
}

/// Execute remove-contact command
pub fn remove_contact(session: &Session, uid: &UserId, contact: &UserId) -> Result<()> {
    let report = session.revocation().remove_contact(uid, contact)?;

    for (id, error) in &report.failed {
        warn!(entity_id = %id, error = %error, "Revocation failed");
    }
    info!(
        contact = %contact,
        revoked = report.succeeded.len(),
        failed = report.failed.len(),
        "✅ Contact removed"
    );
    Ok(())
}
