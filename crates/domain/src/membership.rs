use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::{ActorIdentity, normalize_id};
use crate::ports::membership::{StoreError, ToggleStore};
use crate::subjects::Subject;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MembershipKind {
    Like,
    Scrap,
}

impl MembershipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipKind::Like => "like",
            MembershipKind::Scrap => "scrap",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "like" | "likes" => Some(MembershipKind::Like),
            "scrap" | "scraps" => Some(MembershipKind::Scrap),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MembershipKey {
    pub kind: MembershipKind,
    pub subject_id: String,
    pub actor_id: String,
}

impl MembershipKey {
    pub fn new(
        kind: MembershipKind,
        subject_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            actor_id: actor_id.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub kind: MembershipKind,
    pub subject_id: String,
    pub actor_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Join,
    Leave,
}

impl Transition {
    pub fn toward(target_state: bool) -> Self {
        if target_state {
            Transition::Join
        } else {
            Transition::Leave
        }
    }

    pub fn delta(self) -> i64 {
        match self {
            Transition::Join => 1,
            Transition::Leave => -1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToggleRequest {
    pub subject_id: String,
    /// What the client thinks the current state is. Picks the direction only.
    pub client_believed_state: bool,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleResolution {
    Applied,
    AlreadyInState,
    RaceAbsorbed,
}

impl ToggleResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToggleResolution::Applied => "applied",
            ToggleResolution::AlreadyInState => "already_in_state",
            ToggleResolution::RaceAbsorbed => "race_absorbed",
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub new_state: bool,
    pub count: i64,
    pub resolution: ToggleResolution,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CounterAudit {
    pub subject_id: String,
    pub kind: MembershipKind,
    pub counter: i64,
    pub memberships: i64,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct MembershipService {
    store: Arc<dyn ToggleStore>,
}

impl MembershipService {
    pub fn new(store: Arc<dyn ToggleStore>) -> Self {
        Self { store }
    }

    pub async fn toggle(
        &self,
        kind: MembershipKind,
        actor: &ActorIdentity,
        request: ToggleRequest,
    ) -> DomainResult<ToggleOutcome> {
        let subject_id = normalize_id("subject_id", &request.subject_id)?;
        let key = MembershipKey::new(kind, subject_id, actor.actor_id.clone());

        // Row before subject: a no-op never reports a counter older than the row it saw.
        let current = self
            .store
            .exists(&key)
            .await
            .map_err(|err| map_store_error(err, &key.subject_id))?;
        let subject = self.require_subject(&key.subject_id).await?;

        let target = !request.client_believed_state;
        if current == target {
            return Ok(ToggleOutcome {
                new_state: current,
                count: subject.counter(kind),
                resolution: ToggleResolution::AlreadyInState,
            });
        }

        let transition = Transition::toward(target);
        match self.store.apply(&key, transition).await {
            Ok(count) => Ok(ToggleOutcome {
                new_state: target,
                count,
                resolution: ToggleResolution::Applied,
            }),
            Err(StoreError::AlreadyExists) if transition == Transition::Join => {
                self.absorb_race(&key).await
            }
            Err(StoreError::NotFound) if transition == Transition::Leave => {
                self.absorb_race(&key).await
            }
            Err(err) => Err(map_store_error(err, &key.subject_id)),
        }
    }

    pub async fn status(
        &self,
        kind: MembershipKind,
        subject_id: &str,
        actor: &ActorIdentity,
    ) -> DomainResult<bool> {
        let subject_id = normalize_id("subject_id", subject_id)?;
        self.require_subject(&subject_id).await?;
        let key = MembershipKey::new(kind, subject_id, actor.actor_id.clone());
        self.store
            .exists(&key)
            .await
            .map_err(|err| map_store_error(err, &key.subject_id))
    }

    pub async fn list_by_actor(
        &self,
        kind: MembershipKind,
        actor: &ActorIdentity,
    ) -> DomainResult<Vec<Membership>> {
        let mut memberships = self
            .store
            .list_by_actor(kind, &actor.actor_id)
            .await
            .map_err(|err| map_store_error(err, ""))?;
        memberships.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        Ok(memberships)
    }

    pub async fn audit(&self, kind: MembershipKind, subject_id: &str) -> DomainResult<CounterAudit> {
        let subject_id = normalize_id("subject_id", subject_id)?;
        let subject = self.require_subject(&subject_id).await?;
        let memberships = self
            .store
            .count_for_subject(kind, &subject_id)
            .await
            .map_err(|err| map_store_error(err, &subject_id))?;
        let counter = subject.counter(kind);
        Ok(CounterAudit {
            subject_id,
            kind,
            counter,
            memberships,
            consistent: counter == memberships,
        })
    }

    async fn require_subject(&self, subject_id: &str) -> DomainResult<Subject> {
        self.store
            .get_subject(subject_id)
            .await
            .map_err(|err| map_store_error(err, subject_id))?
            .ok_or_else(|| DomainError::SubjectNotFound(subject_id.to_string()))
    }

    // Another caller committed the same transition first; report what is stored now.
    async fn absorb_race(&self, key: &MembershipKey) -> DomainResult<ToggleOutcome> {
        let subject = self.require_subject(&key.subject_id).await?;
        let state = self
            .store
            .exists(key)
            .await
            .map_err(|err| map_store_error(err, &key.subject_id))?;
        Ok(ToggleOutcome {
            new_state: state,
            count: subject.counter(key.kind),
            resolution: ToggleResolution::RaceAbsorbed,
        })
    }
}

pub(crate) fn map_store_error(err: StoreError, subject_id: &str) -> DomainError {
    match err {
        StoreError::SubjectMissing => DomainError::SubjectNotFound(subject_id.to_string()),
        StoreError::Unavailable(message) => DomainError::StorageUnavailable(message),
        StoreError::CounterUpdateFailed(message) => {
            DomainError::StorageUnavailable(format!("counter update failed: {message}"))
        }
        StoreError::AlreadyExists | StoreError::NotFound | StoreError::Conflict => {
            DomainError::Conflict
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ports::BoxFuture;
    use crate::ports::membership::MembershipStore;
    use crate::ports::subjects::SubjectStore;

    struct ScriptedStore {
        subject: Option<Subject>,
        member: Mutex<bool>,
        apply_result: Mutex<Option<Result<i64, StoreError>>>,
        apply_calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(subject: Option<Subject>, member: bool) -> Self {
            Self {
                subject,
                member: Mutex::new(member),
                apply_result: Mutex::new(None),
                apply_calls: AtomicUsize::new(0),
            }
        }

        fn with_apply_result(self, result: Result<i64, StoreError>) -> Self {
            *self.apply_result.lock().unwrap() = Some(result);
            self
        }

        fn apply_calls(&self) -> usize {
            self.apply_calls.load(Ordering::SeqCst)
        }
    }

    impl MembershipStore for ScriptedStore {
        fn exists(&self, _key: &MembershipKey) -> BoxFuture<'_, Result<bool, StoreError>> {
            Box::pin(async move { Ok(*self.member.lock().unwrap()) })
        }

        fn insert(&self, _key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async move { Err(StoreError::Unavailable("not scripted".into())) })
        }

        fn remove(&self, _key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async move { Err(StoreError::Unavailable("not scripted".into())) })
        }

        fn list_by_actor(
            &self,
            _kind: MembershipKind,
            _actor_id: &str,
        ) -> BoxFuture<'_, Result<Vec<Membership>, StoreError>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn count_for_subject(
            &self,
            _kind: MembershipKind,
            _subject_id: &str,
        ) -> BoxFuture<'_, Result<i64, StoreError>> {
            Box::pin(async move { Ok(i64::from(*self.member.lock().unwrap())) })
        }
    }

    impl SubjectStore for ScriptedStore {
        fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>> {
            let subject = subject.clone();
            Box::pin(async move { Ok(subject) })
        }

        fn get_subject(
            &self,
            _subject_id: &str,
        ) -> BoxFuture<'_, Result<Option<Subject>, StoreError>> {
            Box::pin(async move { Ok(self.subject.clone()) })
        }
    }

    impl ToggleStore for ScriptedStore {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async move { Ok(()) })
        }

        fn apply(
            &self,
            _key: &MembershipKey,
            transition: Transition,
        ) -> BoxFuture<'_, Result<i64, StoreError>> {
            Box::pin(async move {
                self.apply_calls.fetch_add(1, Ordering::SeqCst);
                let result = self
                    .apply_result
                    .lock()
                    .unwrap()
                    .take()
                    .expect("apply result scripted");
                // a lost race means the winner's write is now visible
                if matches!(
                    result,
                    Err(StoreError::AlreadyExists) | Err(StoreError::NotFound)
                ) {
                    *self.member.lock().unwrap() = transition == Transition::Join;
                }
                result
            })
        }
    }

    fn subject_with_likes(like_count: i64) -> Subject {
        Subject {
            like_count,
            ..Subject::new("q-1", 0)
        }
    }

    fn actor() -> ActorIdentity {
        ActorIdentity::new("user-a").unwrap()
    }

    fn join(subject_id: &str) -> ToggleRequest {
        ToggleRequest {
            subject_id: subject_id.to_string(),
            client_believed_state: false,
        }
    }

    fn leave(subject_id: &str) -> ToggleRequest {
        ToggleRequest {
            subject_id: subject_id.to_string(),
            client_believed_state: true,
        }
    }

    #[tokio::test]
    async fn join_applies_transition() {
        let store =
            Arc::new(ScriptedStore::new(Some(subject_with_likes(0)), false).with_apply_result(Ok(1)));
        let service = MembershipService::new(store.clone());

        let outcome = service
            .toggle(MembershipKind::Like, &actor(), join("q-1"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ToggleOutcome {
                new_state: true,
                count: 1,
                resolution: ToggleResolution::Applied,
            }
        );
        assert_eq!(store.apply_calls(), 1);
    }

    #[tokio::test]
    async fn stale_belief_is_a_no_op() {
        let store = Arc::new(ScriptedStore::new(Some(subject_with_likes(1)), true));
        let service = MembershipService::new(store.clone());

        let outcome = service
            .toggle(MembershipKind::Like, &actor(), join("q-1"))
            .await
            .unwrap();

        assert!(outcome.new_state);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.resolution, ToggleResolution::AlreadyInState);
        assert_eq!(store.apply_calls(), 0);
    }

    #[tokio::test]
    async fn lost_insert_race_is_absorbed() {
        let store = Arc::new(
            ScriptedStore::new(Some(subject_with_likes(1)), false)
                .with_apply_result(Err(StoreError::AlreadyExists)),
        );
        let service = MembershipService::new(store);

        let outcome = service
            .toggle(MembershipKind::Like, &actor(), join("q-1"))
            .await
            .unwrap();

        assert!(outcome.new_state);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.resolution, ToggleResolution::RaceAbsorbed);
    }

    #[tokio::test]
    async fn lost_delete_race_is_absorbed() {
        let store = Arc::new(
            ScriptedStore::new(Some(subject_with_likes(0)), true)
                .with_apply_result(Err(StoreError::NotFound)),
        );
        let service = MembershipService::new(store);

        let outcome = service
            .toggle(MembershipKind::Like, &actor(), leave("q-1"))
            .await
            .unwrap();

        assert!(!outcome.new_state);
        assert_eq!(outcome.resolution, ToggleResolution::RaceAbsorbed);
    }

    #[tokio::test]
    async fn missing_subject_performs_no_writes() {
        let store = Arc::new(ScriptedStore::new(None, false));
        let service = MembershipService::new(store.clone());

        let err = service
            .toggle(MembershipKind::Like, &actor(), leave("q-404"))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::SubjectNotFound(ref id) if id == "q-404"));
        assert_eq!(store.apply_calls(), 0);
    }

    #[tokio::test]
    async fn subject_removed_mid_toggle_is_not_found() {
        let store = Arc::new(
            ScriptedStore::new(Some(subject_with_likes(0)), false)
                .with_apply_result(Err(StoreError::SubjectMissing)),
        );
        let service = MembershipService::new(store);

        let err = service
            .toggle(MembershipKind::Like, &actor(), join("q-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::SubjectNotFound(_)));
    }

    #[tokio::test]
    async fn storage_failures_are_retryable() {
        for failure in [
            StoreError::Unavailable("connection reset".into()),
            StoreError::CounterUpdateFailed("check constraint".into()),
        ] {
            let store = Arc::new(
                ScriptedStore::new(Some(subject_with_likes(0)), false)
                    .with_apply_result(Err(failure)),
            );
            let service = MembershipService::new(store);

            let err = service
                .toggle(MembershipKind::Like, &actor(), join("q-1"))
                .await
                .unwrap_err();

            assert!(matches!(err, DomainError::StorageUnavailable(_)));
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn blank_subject_id_is_rejected() {
        let store = Arc::new(ScriptedStore::new(Some(subject_with_likes(0)), false));
        let service = MembershipService::new(store.clone());

        let err = service
            .toggle(MembershipKind::Scrap, &actor(), join("  "))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(store.apply_calls(), 0);
    }

    #[tokio::test]
    async fn audit_compares_counter_with_rows() {
        let store = Arc::new(ScriptedStore::new(Some(subject_with_likes(2)), true));
        let service = MembershipService::new(store);

        let audit = service.audit(MembershipKind::Like, "q-1").await.unwrap();

        assert_eq!(audit.counter, 2);
        assert_eq!(audit.memberships, 1);
        assert!(!audit.consistent);
    }

    #[test]
    fn transition_direction_follows_target() {
        assert_eq!(Transition::toward(true), Transition::Join);
        assert_eq!(Transition::toward(false).delta(), -1);
        assert_eq!(MembershipKind::parse("scraps"), Some(MembershipKind::Scrap));
        assert_eq!(MembershipKind::parse("vote"), None);
    }
}
