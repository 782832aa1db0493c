//! Soft-delete aware creation.
//!
//! The platform tombstones on delete, and a tombstone keeps its natural key.
//! Creating the same key again fails with a conflict until the tombstone is
//! brought back, so creation goes through [`SoftDeleteRestorer`].

use crate::error::{Error, Result};
use crate::remote::{Lifecycle, RemoteEntity, RemoteError};
use crate::retry::{Attempt, RetryCoordinator, Subject};

/// Remote operations needed to create or resurrect an entity.
pub trait TombstoneStore {
    /// Payload of a create call
    type Draft;
    /// Entity returned by the service
    type Entity: RemoteEntity;

    /// Issue the create call.
    fn create(&self, draft: &Self::Draft) -> std::result::Result<Self::Entity, RemoteError>;

    /// Search for a tombstoned entity holding `natural_key`.
    fn find_deleted(
        &self,
        natural_key: &str,
    ) -> std::result::Result<Option<Self::Entity>, RemoteError>;

    /// Move `entity` from its current lifecycle to `to`.
    fn transition(
        &self,
        entity: &Self::Entity,
        to: Lifecycle,
    ) -> std::result::Result<Self::Entity, RemoteError>;
}

/// How an entity came to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<E> {
    /// The create call succeeded
    Created(E),
    /// A tombstone with the same natural key was restored
    Restored(E),
}

impl<E> CreateOutcome<E> {
    pub fn entity(&self) -> &E {
        match self {
            Self::Created(e) | Self::Restored(e) => e,
        }
    }

    pub fn into_entity(self) -> E {
        match self {
            Self::Created(e) | Self::Restored(e) => e,
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored(_))
    }
}

/// Creates entities, falling back to restoring a same-key tombstone.
#[derive(Debug, Clone)]
pub struct SoftDeleteRestorer {
    search: RetryCoordinator,
    write: RetryCoordinator,
    tombstone: RetryCoordinator,
}

impl SoftDeleteRestorer {
    /// # Arguments
    /// * `search` - Short window for the search that follows a create conflict
    /// * `write` - Versioned-write retry for the state transition
    /// * `tombstone` - Long window for a delete to become visible as a tombstone
    pub fn new(search: RetryCoordinator, write: RetryCoordinator, tombstone: RetryCoordinator) -> Self {
        Self {
            search,
            write,
            tombstone,
        }
    }

    /// Create `draft`, or restore the tombstone holding `natural_key`.
    ///
    /// On a conflict the deleted-state search is retried until it finds a
    /// match or its window closes. A match gets exactly one state transition
    /// to `desired` (more only on version mismatch), then `reapply` runs the
    /// full update path against the restored entity. No match means a real
    /// collision, and the original conflict is returned.
    pub fn create_or_restore<S, F>(
        &self,
        store: &S,
        natural_key: &str,
        draft: &S::Draft,
        desired: Lifecycle,
        reapply: F,
    ) -> Result<CreateOutcome<S::Entity>>
    where
        S: TombstoneStore,
        F: FnOnce(&S::Entity) -> Result<()>,
    {
        let conflict = match store.create(draft) {
            Ok(entity) => {
                log::debug!("Created {natural_key} ({})", entity.id());
                return Ok(CreateOutcome::Created(entity));
            }
            Err(err) if err.is_conflict() => err,
            Err(err) => return Err(Error::api("create", natural_key, err)),
        };

        log::info!("{natural_key} conflicts with an existing entity, looking for a tombstone");

        let found = match self.search.run(&Subject::new("find deleted", natural_key), || {
            find_attempt(store, natural_key)
        }) {
            Ok(entity) => entity,
            Err(Error::Timeout { .. }) => {
                log::debug!("No tombstone for {natural_key}; conflict is genuine");
                return Err(Error::api("create", natural_key, conflict));
            }
            Err(err) => return Err(err),
        };

        let mut current = found;
        let restored = self.write.run(&Subject::new("restore", natural_key), || {
            match store.transition(&current, desired) {
                Ok(entity) => Attempt::Success(entity),
                Err(err) if err.is_version_mismatch() => {
                    // Refresh the version before the next attempt
                    match store.find_deleted(natural_key) {
                        Ok(Some(fresh)) => current = fresh,
                        Ok(None) => log::debug!("{natural_key}: tombstone gone from search"),
                        Err(refresh) if refresh.is_not_found() => {
                            log::debug!("{natural_key}: refresh failed: {refresh}");
                        }
                        Err(refresh) => return Attempt::Fatal(refresh),
                    }
                    Attempt::Retryable(err.to_string())
                }
                Err(err) => Attempt::Fatal(err),
            }
        })?;

        log::info!(
            "Restored {natural_key} ({}) from {} to {desired}",
            restored.id(),
            Lifecycle::Deleted
        );

        reapply(&restored)?;
        Ok(CreateOutcome::Restored(restored))
    }

    /// Wait until a deleted entity shows up as a tombstone in search.
    pub fn await_tombstone<S: TombstoneStore>(
        &self,
        store: &S,
        natural_key: &str,
    ) -> Result<S::Entity> {
        self.tombstone
            .run(&Subject::new("await tombstone", natural_key), || {
                find_attempt(store, natural_key)
            })
    }
}

fn find_attempt<S: TombstoneStore>(store: &S, natural_key: &str) -> Attempt<S::Entity> {
    match store.find_deleted(natural_key) {
        Ok(Some(entity)) => Attempt::Success(entity),
        Ok(None) => Attempt::Retryable(format!("no deleted entity with key {natural_key}")),
        Err(err) if err.is_not_found() => Attempt::Retryable(err.to_string()),
        Err(err) => Attempt::Fatal(err),
    }
}
