use std::collections::HashMap;
use std::sync::Arc;

use campus_domain::membership::{Membership, MembershipKey, MembershipKind, Transition};
use campus_domain::ports::BoxFuture;
use campus_domain::ports::membership::{MembershipStore, StoreError, ToggleStore};
use campus_domain::ports::subjects::SubjectStore;
use campus_domain::subjects::Subject;
use campus_domain::util::now_ms;
use tokio::sync::RwLock;

#[derive(Default)]
struct InMemoryState {
    subjects: HashMap<String, Subject>,
    memberships: HashMap<MembershipKey, i64>,
}

/// Process-local store. Every write runs under one guard, which is what makes
/// [`ToggleStore::apply`] atomic here.
#[derive(Clone, Default)]
pub struct InMemoryToggleStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryToggleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MembershipStore for InMemoryToggleStore {
    fn exists(&self, key: &MembershipKey) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.clone();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.memberships.contains_key(&key)) })
    }

    fn insert(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if !state.subjects.contains_key(&key.subject_id) {
                return Err(StoreError::SubjectMissing);
            }
            if state.memberships.contains_key(&key) {
                return Err(StoreError::AlreadyExists);
            }
            state.memberships.insert(key, now_ms());
            Ok(())
        })
    }

    fn remove(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        let state = self.state.clone();
        Box::pin(async move {
            state
                .write()
                .await
                .memberships
                .remove(&key)
                .map(|_| ())
                .ok_or(StoreError::NotFound)
        })
    }

    fn list_by_actor(
        &self,
        kind: MembershipKind,
        actor_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Membership>, StoreError>> {
        let actor_id = actor_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let memberships = state
                .read()
                .await
                .memberships
                .iter()
                .filter(|(key, _)| key.kind == kind && key.actor_id == actor_id)
                .map(|(key, created_at_ms)| Membership {
                    kind,
                    subject_id: key.subject_id.clone(),
                    actor_id: key.actor_id.clone(),
                    created_at_ms: *created_at_ms,
                })
                .collect();
            Ok(memberships)
        })
    }

    fn count_for_subject(
        &self,
        kind: MembershipKind,
        subject_id: &str,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let subject_id = subject_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let count = state
                .read()
                .await
                .memberships
                .keys()
                .filter(|key| key.kind == kind && key.subject_id == subject_id)
                .count();
            Ok(count as i64)
        })
    }
}

impl SubjectStore for InMemoryToggleStore {
    fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>> {
        let subject = subject.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if state.subjects.contains_key(&subject.subject_id) {
                return Err(StoreError::Conflict);
            }
            state
                .subjects
                .insert(subject.subject_id.clone(), subject.clone());
            Ok(subject)
        })
    }

    fn get_subject(&self, subject_id: &str) -> BoxFuture<'_, Result<Option<Subject>, StoreError>> {
        let subject_id = subject_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.subjects.get(&subject_id).cloned()) })
    }
}

impl ToggleStore for InMemoryToggleStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { Ok(()) })
    }

    fn apply(
        &self,
        key: &MembershipKey,
        transition: Transition,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let key = key.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let counter = state
                .subjects
                .get(&key.subject_id)
                .map(|subject| subject.counter(key.kind))
                .ok_or(StoreError::SubjectMissing)?;
            let present = state.memberships.contains_key(&key);
            if present == (transition == Transition::Join) {
                return Err(match transition {
                    Transition::Join => StoreError::AlreadyExists,
                    Transition::Leave => StoreError::NotFound,
                });
            }
            let next = counter + transition.delta();
            if next < 0 {
                return Err(StoreError::CounterUpdateFailed(format!(
                    "{} counter of {} would become {next}",
                    key.kind.as_str(),
                    key.subject_id
                )));
            }

            // Nothing has been mutated yet.
            match transition {
                Transition::Join => {
                    state.memberships.insert(key.clone(), now_ms());
                }
                Transition::Leave => {
                    state.memberships.remove(&key);
                }
            }
            if let Some(subject) = state.subjects.get_mut(&key.subject_id) {
                *subject.counter_mut(key.kind) = next;
            }
            Ok(next)
        })
    }
}
