use thiserror::Error;

use super::BoxFuture;
use super::subjects::SubjectStore;
use crate::membership::{Membership, MembershipKey, MembershipKind, Transition};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("membership already exists")]
    AlreadyExists,
    #[error("membership not found")]
    NotFound,
    #[error("subject missing")]
    SubjectMissing,
    #[error("conflict")]
    Conflict,
    #[error("counter update failed: {0}")]
    CounterUpdateFailed(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable (subject, actor) pairs, one table per [`MembershipKind`].
///
/// Uniqueness of a pair is enforced by the storage layer itself, so two racing
/// inserts for the same key cannot both succeed.
pub trait MembershipStore: Send + Sync {
    fn exists(&self, key: &MembershipKey) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Row-level insert. Does not touch subject counters; see [`ToggleStore::apply`].
    fn insert(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Row-level delete. Does not touch subject counters; see [`ToggleStore::apply`].
    fn remove(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>>;

    fn list_by_actor(
        &self,
        kind: MembershipKind,
        actor_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Membership>, StoreError>>;

    /// Live aggregate over the membership rows, independent of the subject counter.
    fn count_for_subject(
        &self,
        kind: MembershipKind,
        subject_id: &str,
    ) -> BoxFuture<'_, Result<i64, StoreError>>;
}

pub trait ToggleStore: MembershipStore + SubjectStore {
    fn name(&self) -> &'static str;

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Applies `transition` to the membership row and moves the subject's counter for
    /// `key.kind` by [`Transition::delta`] as one atomic unit, returning the new counter.
    ///
    /// On any error nothing is written. `AlreadyExists` / `NotFound` mean the row was
    /// already in the target state when the unit ran.
    fn apply(
        &self,
        key: &MembershipKey,
        transition: Transition,
    ) -> BoxFuture<'_, Result<i64, StoreError>>;
}
