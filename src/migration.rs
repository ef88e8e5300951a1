//! Key migration: moving every wrapped key of a user to a new key pair.
//!
//! ```text
//! Idle ──▶ Counting ──▶ Migrating ──▶ Verifying ──┬──▶ Complete
//!                                                 └──▶ PartiallyFailed
//! ```
//!
//! - **Counting**: paginated queries over owned and shared-with entities,
//!   deduplicated by id, keeping those with a wrapped key for the user
//! - **Migrating**: bounded batches; each entity is re-read, its wrapped key
//!   opened with the old private key and rewrapped for the new public key.
//!   Only `encryptedKeys[uid]` changes. Per-entity failures are collected.
//! - **Verifying**: a wrap/unwrap round trip with the new key pair, then
//!   re-reads of migrated entities with backoff to absorb store lag. When a
//!   wrapped private key is supplied the new pair is published here, and a
//!   second count picks up entities shared with the user after the first.
//!
//! Before anything is rewrapped, the new public key and its wrapped private
//! key are staged in the profile store's pending slot. Entities migrated by
//! a run that ends `PartiallyFailed` open under that pending pair, and the
//! rest still open under the old one. The slot is cleared only on `Complete`,
//! and a run with a different key pair is refused while it is occupied.
//!
//! Entities whose wrapped key already opens under the new key are counted
//! as succeeded without a write, so a failed run can simply be repeated
//! with the pending pair (see [`unlock_pending_key_pair`]).

use crate::config::MigrationConfig;
use crate::crypto::envelope::{rewrap_content_key, unwrap_content_key, wrap_content_key};
use crate::crypto::keys::{KeyPair, PrivateKey, PublicKey};
use crate::crypto::password::{unwrap_private_key, Passphrase, WrappedPrivateKey};
use crate::crypto::symmetric::ContentKey;
use crate::crypto::timing::TimingSafe;
use crate::error::{Result, ShareError};
use crate::retry::retry_with_backoff;
use crate::store::{
    query_all, update_entity, DocumentStore, EntityFilter, PendingKeyPair, ProfileStore,
};
use crate::types::{EntityId, UserId};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of one migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    Idle,
    Counting,
    Migrating,
    Verifying,
    Complete,
    PartiallyFailed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Complete | MigrationState::PartiallyFailed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Idle, Counting)
                | (Counting, Migrating)
                | (Migrating, Verifying)
                | (Verifying, Complete)
                | (Verifying, PartiallyFailed)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationState::Idle => "idle",
            MigrationState::Counting => "counting",
            MigrationState::Migrating => "migrating",
            MigrationState::Verifying => "verifying",
            MigrationState::Complete => "complete",
            MigrationState::PartiallyFailed => "partially-failed",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag, checked between entities
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inputs of one migration run
pub struct MigrationRequest<'a> {
    pub uid: &'a UserId,
    pub old_private_key: &'a PrivateKey,
    pub new_key_pair: &'a KeyPair,
    /// Staged before migrating and published with the new public key on
    /// `Complete`. With `None` the profile is left untouched and the caller
    /// alone holds the new key pair.
    pub new_wrapped_private_key: Option<&'a WrappedPrivateKey>,
    /// Restricts the run to these ids (resume after a partial failure)
    pub only: Option<&'a BTreeSet<EntityId>>,
}

/// Terminal outcome of a migration run
#[derive(Debug)]
pub struct MigrationReport {
    pub state: MigrationState,
    /// Entities found with a wrapped key for the user, plus any the second
    /// count after publication found outside the first
    pub total: usize,
    /// Entities that now open under the new key (includes `already_migrated`)
    pub succeeded: Vec<EntityId>,
    /// Entities that needed no write
    pub already_migrated: usize,
    pub failed: Vec<(EntityId, ShareError)>,
    pub verification_error: Option<ShareError>,
    /// Whether the new key pair was written to the profile store
    pub published: bool,
}

impl MigrationReport {
    fn new(total: usize) -> Self {
        Self {
            state: MigrationState::Idle,
            total,
            succeeded: Vec::new(),
            already_migrated: 0,
            failed: Vec::new(),
            verification_error: None,
            published: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == MigrationState::Complete
    }

    /// Ids to pass as [`MigrationRequest::only`] when resuming
    pub fn failed_ids(&self) -> BTreeSet<EntityId> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }
}

enum EntityOutcome {
    Rewrapped,
    AlreadyMigrated,
}

pub struct KeyMigrationService {
    docs: Arc<dyn DocumentStore>,
    profiles: Arc<dyn ProfileStore>,
    config: MigrationConfig,
}

impl KeyMigrationService {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        profiles: Arc<dyn ProfileStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            docs,
            profiles,
            config,
        }
    }

    pub fn with_store<S>(store: Arc<S>, config: MigrationConfig) -> Self
    where
        S: DocumentStore + ProfileStore + 'static,
    {
        Self::new(store.clone(), store, config)
    }

    /// Runs a migration to completion or cancellation
    ///
    /// Only a refused or failed staging step and a failing first count are
    /// returned as `Err`; everything after that lands in the report.
    pub fn migrate(&self, request: &MigrationRequest<'_>, cancel: &CancellationToken) -> Result<MigrationReport> {
        let uid = request.uid;
        if !request.new_key_pair.is_valid() {
            return Err(ShareError::key_generation("new key pair is inconsistent"));
        }
        self.stage(request)?;

        let mut state = MigrationState::Idle;
        advance(&mut state, MigrationState::Counting, uid);
        let ids = self.count(uid, request.only)?;

        let mut report = MigrationReport::new(ids.len());
        advance(&mut state, MigrationState::Migrating, uid);
        self.migrate_batches(request, &ids, cancel, &mut report);

        advance(&mut state, MigrationState::Verifying, uid);
        if let Err(e) = self.verify(request, &report.succeeded) {
            warn!(uid = %uid, error = %e, "Migration verification failed");
            report.verification_error = Some(e);
        }

        let clean = report.failed.is_empty() && report.verification_error.is_none();
        let outcome = match (clean, request.new_wrapped_private_key) {
            (false, _) => MigrationState::PartiallyFailed,
            (true, None) => MigrationState::Complete,
            (true, Some(wrapped)) => match self.finish(request, wrapped, cancel, &mut report) {
                Ok(()) if report.failed.is_empty() => {
                    self.release(uid);
                    MigrationState::Complete
                }
                Ok(()) => MigrationState::PartiallyFailed,
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Publishing or the second count failed");
                    report.verification_error = Some(e);
                    MigrationState::PartiallyFailed
                }
            },
        };
        advance(&mut state, outcome, uid);

        report.state = state;
        info!(
            uid = %uid,
            state = %report.state,
            total = report.total,
            succeeded = report.succeeded.len(),
            already_migrated = report.already_migrated,
            failed = report.failed.len(),
            published = report.published,
            "Key migration finished"
        );
        Ok(report)
    }

    /// Key pair staged by an unfinished run, if any
    pub fn pending_key_pair(&self, uid: &UserId) -> Result<Option<PendingKeyPair>> {
        self.profiles.get_pending_key_pair(uid)
    }

    /// Writes the new key pair to the pending slot
    ///
    /// A different pair already pending is refused unless it has since been
    /// published: entities migrated to it open under nothing else.
    fn stage(&self, request: &MigrationRequest<'_>) -> Result<()> {
        let uid = request.uid;
        let new_public = request.new_key_pair.public_key();

        if let Some(pending) = self.profiles.get_pending_key_pair(uid)? {
            let same = TimingSafe::bytes_equal(pending.public_key.as_bytes(), new_public.as_bytes());
            let published = self.profiles.get_public_key(uid)?.is_some_and(|current| {
                TimingSafe::bytes_equal(current.as_bytes(), pending.public_key.as_bytes())
            });
            if !same && !published {
                return Err(ShareError::validation(format!(
                    "{} has an unfinished migration to key {}; resume it with that key pair",
                    uid,
                    pending.public_key.fingerprint_hex()
                )));
            }
        }

        if let Some(wrapped) = request.new_wrapped_private_key {
            let pending = PendingKeyPair {
                public_key: new_public.clone(),
                wrapped_private_key: wrapped.clone(),
            };
            self.profiles.stage_pending_key_pair(uid, &pending)?;
            debug!(uid = %uid, fingerprint = %new_public.fingerprint_hex(), "Staged new key pair");
        }
        Ok(())
    }

    fn release(&self, uid: &UserId) {
        // A leftover slot matching the published key is ignored by `stage`
        if let Err(e) = self.profiles.clear_pending_key_pair(uid) {
            warn!(uid = %uid, error = %e, "Failed to clear the pending key pair");
        }
    }

    /// Publishes the new key pair, then migrates entities shared with the
    /// user after the first count
    ///
    /// Grants resolved before publication wrap for the old public key, so
    /// without the second pass those entities would be lost with it.
    fn finish(
        &self,
        request: &MigrationRequest<'_>,
        wrapped: &WrappedPrivateKey,
        cancel: &CancellationToken,
        report: &mut MigrationReport,
    ) -> Result<()> {
        self.publish(request.uid, request.new_key_pair, wrapped, report)?;

        let seen: BTreeSet<EntityId> = report
            .succeeded
            .iter()
            .cloned()
            .chain(report.failed_ids())
            .collect();
        let late: Vec<EntityId> = self
            .count(request.uid, None)?
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        if late.is_empty() {
            return Ok(());
        }

        info!(uid = %request.uid, entities = late.len(), "Migrating entities shared during the run");
        let first_late = report.succeeded.len();
        report.total += late.len();
        self.migrate_batches(request, &late, cancel, report);
        self.verify(request, &report.succeeded[first_late..])
    }

    fn count(&self, uid: &UserId, only: Option<&BTreeSet<EntityId>>) -> Result<Vec<EntityId>> {
        let filters = [
            EntityFilter::OwnedBy(uid.clone()),
            EntityFilter::SharedWith(uid.clone()),
        ];

        let mut ids = BTreeSet::new();
        for filter in &filters {
            for entity in query_all(self.docs.as_ref(), filter, self.config.page_size)? {
                if entity.has_access(uid) && only.map_or(true, |set| set.contains(&entity.id)) {
                    ids.insert(entity.id);
                }
            }
        }

        debug!(uid = %uid, entities = ids.len(), "Counted entities to migrate");
        Ok(ids.into_iter().collect())
    }

    fn migrate_batches(
        &self,
        request: &MigrationRequest<'_>,
        ids: &[EntityId],
        cancel: &CancellationToken,
        report: &mut MigrationReport,
    ) {
        let batch_size = self.config.batch_size.max(1);
        let mut processed = 0usize;

        for (batch_index, batch) in ids.chunks(batch_size).enumerate() {
            for id in batch {
                if cancel.is_cancelled() {
                    warn!(uid = %request.uid, remaining = ids.len() - processed, "Migration cancelled");
                    for pending in &ids[processed..] {
                        report.failed.push((pending.clone(), ShareError::Cancelled));
                    }
                    return;
                }

                match self.migrate_entity(request, id) {
                    Ok(EntityOutcome::Rewrapped) => report.succeeded.push(id.clone()),
                    Ok(EntityOutcome::AlreadyMigrated) => {
                        report.already_migrated += 1;
                        report.succeeded.push(id.clone());
                    }
                    Err(e) => {
                        debug!(entity_id = %id, error = %e, "Entity migration failed");
                        report.failed.push((id.clone(), e));
                    }
                }
                processed += 1;
            }
            debug!(batch = batch_index, processed, total = ids.len(), "Migrated batch");
        }
    }

    fn migrate_entity(&self, request: &MigrationRequest<'_>, id: &EntityId) -> Result<EntityOutcome> {
        let uid = request.uid;
        let new_private = request.new_key_pair.private_key();
        let new_public = request.new_key_pair.public_key();
        let mut rng = OsRng;
        let mut outcome = EntityOutcome::Rewrapped;

        update_entity(self.docs.as_ref(), id, self.config.max_write_retries, |entity| {
            let current = entity.wrapped_key_for(uid)?;
            if unwrap_content_key(current, new_private).is_ok() {
                outcome = EntityOutcome::AlreadyMigrated;
                return Ok(false);
            }

            let rewrapped = rewrap_content_key(current, request.old_private_key, new_public, &mut rng)?;
            entity.set_wrapped_key(uid.clone(), rewrapped);
            outcome = EntityOutcome::Rewrapped;
            Ok(true)
        })?;

        Ok(outcome)
    }

    fn verify(&self, request: &MigrationRequest<'_>, migrated: &[EntityId]) -> Result<()> {
        let uid = request.uid;
        let new_private = request.new_key_pair.private_key();
        round_trip(request.new_key_pair.public_key(), new_private).map_err(|_| {
            ShareError::migration_verification("wrap round trip with the new key pair failed")
        })?;

        let sample: Vec<&EntityId> = match self.config.verify_sample {
            Some(n) if n < migrated.len() => migrated.choose_multiple(&mut OsRng, n).collect(),
            _ => migrated.iter().collect(),
        };

        for id in sample {
            let result = retry_with_backoff(
                &self.config.verify,
                |e| matches!(e, ShareError::DecryptionFailed) || e.is_retryable(),
                |_| {
                    let entity = self
                        .docs
                        .get(id)?
                        .ok_or_else(|| ShareError::not_found(format!("entity {}", id)))?;
                    unwrap_content_key(entity.wrapped_key_for(uid)?, new_private).map(|_| ())
                },
            );

            match result {
                Ok(()) => {}
                // Deleted or revoked since it was migrated
                Err(ShareError::NotFound(_)) | Err(ShareError::NoWrappedKey { .. }) => {
                    debug!(entity_id = %id, "Skipping verification of departed entity");
                }
                Err(e) => {
                    return Err(ShareError::migration_verification(format!(
                        "entity {} does not open under the new key: {}",
                        id, e
                    )));
                }
            }
        }

        Ok(())
    }

    fn publish(
        &self,
        uid: &UserId,
        new_key_pair: &KeyPair,
        wrapped: &WrappedPrivateKey,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let new_public = new_key_pair.public_key();
        self.profiles.publish_key_pair(uid, new_public, wrapped)?;
        report.published = true;

        retry_with_backoff(
            &self.config.verify,
            |e| matches!(e, ShareError::MigrationVerification(_)) || e.is_retryable(),
            |_| {
                let published = self
                    .profiles
                    .get_public_key(uid)?
                    .ok_or_else(|| ShareError::migration_verification("published key not visible"))?;
                if !TimingSafe::bytes_equal(published.as_bytes(), new_public.as_bytes()) {
                    return Err(ShareError::migration_verification("published key differs from the new key"));
                }
                round_trip(&published, new_key_pair.private_key()).map_err(|_| {
                    ShareError::migration_verification("published key does not pair with the new private key")
                })
            },
        )?;

        info!(uid = %uid, fingerprint = %new_public.fingerprint_hex(), "Published migrated key pair");
        Ok(())
    }
}

/// Recovers a staged key pair with the passphrase it was wrapped under
///
/// The result is checked against the staged public key, so it can be passed
/// straight back as [`MigrationRequest::new_key_pair`] to resume.
pub fn unlock_pending_key_pair(pending: &PendingKeyPair, passphrase: &Passphrase) -> Result<KeyPair> {
    let private = unwrap_private_key(&pending.wrapped_private_key, passphrase)?;
    let key_pair = KeyPair::from_private_key(private)?;
    if !TimingSafe::bytes_equal(key_pair.public_key().as_bytes(), pending.public_key.as_bytes()) {
        return Err(ShareError::migration_verification(
            "pending private key does not match the pending public key",
        ));
    }
    Ok(key_pair)
}

fn advance(state: &mut MigrationState, next: MigrationState, uid: &UserId) {
    debug_assert!(state.can_transition_to(next), "{} -> {}", state, next);
    debug!(uid = %uid, from = %state, to = %next, "Migration state change");
    *state = next;
}

/// Wraps a fresh key for `public_key` and checks `private_key` recovers it
fn round_trip(public_key: &PublicKey, private_key: &PrivateKey) -> Result<()> {
    let mut rng = OsRng;
    let content_key = ContentKey::generate(&mut rng)?;
    let wrapped = wrap_content_key(&content_key, public_key, &mut rng)?;
    let recovered = unwrap_content_key(&wrapped, private_key)?;
    if TimingSafe::bytes_equal(recovered.as_bytes(), content_key.as_bytes()) {
        Ok(())
    } else {
        Err(ShareError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use MigrationState::*;
        assert!(Idle.can_transition_to(Counting));
        assert!(Verifying.can_transition_to(Complete));
        assert!(Verifying.can_transition_to(PartiallyFailed));
        assert!(!Idle.can_transition_to(Complete));
        assert!(!PartiallyFailed.can_transition_to(Complete));
        assert!(Complete.is_terminal());
        assert!(!Migrating.is_terminal());
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_round_trip_detects_mismatched_keys() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        assert!(round_trip(a.public_key(), a.private_key()).is_ok());
        assert!(round_trip(a.public_key(), b.private_key()).is_err());
    }

    #[test]
    fn test_terminal_states_have_no_successor() {
        use MigrationState::*;
        for next in [Idle, Counting, Migrating, Verifying, Complete, PartiallyFailed] {
            assert!(!Complete.can_transition_to(next));
            assert!(!PartiallyFailed.can_transition_to(next));
        }
    }
}
