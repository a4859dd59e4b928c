use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use campus_domain::membership::{Membership, MembershipKey, MembershipKind, Transition};
use campus_domain::ports::BoxFuture;
use campus_domain::ports::membership::{MembershipStore, StoreError, ToggleStore};
use campus_domain::ports::subjects::SubjectStore;
use campus_domain::subjects::Subject;
use campus_domain::util::now_ms;
use serde::{Deserialize, Serialize};
use surrealdb::{Response, Surreal, engine::remote::ws::Client};

use crate::db::{DbConfig, connect_surreal};

const SUBJECT_MISSING: &str = "subject_missing";
const MEMBERSHIP_EXISTS: &str = "membership_exists";
const MEMBERSHIP_MISSING: &str = "membership_missing";
const COUNTER_NEGATIVE: &str = "counter_negative";

/// Commits that lose an optimistic write conflict are re-run this many times in total.
const APPLY_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(15);

const SCHEMA: &str = "
DEFINE TABLE IF NOT EXISTS question SCHEMALESS;
DEFINE TABLE IF NOT EXISTS question_like SCHEMALESS;
DEFINE TABLE IF NOT EXISTS question_scrap SCHEMALESS;
DEFINE INDEX IF NOT EXISTS question_like_pair ON TABLE question_like FIELDS subject_id, actor_id UNIQUE;
DEFINE INDEX IF NOT EXISTS question_like_actor ON TABLE question_like FIELDS actor_id;
DEFINE INDEX IF NOT EXISTS question_scrap_pair ON TABLE question_scrap FIELDS subject_id, actor_id UNIQUE;
DEFINE INDEX IF NOT EXISTS question_scrap_actor ON TABLE question_scrap FIELDS actor_id;
";

/// SurrealDB-backed store. Membership record ids are `[subject_id, actor_id]`, so the
/// record id and the pair index both reject a second row for the same key.
#[derive(Clone)]
pub struct SurrealToggleStore {
    client: Arc<Surreal<Client>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealSubjectRow {
    subject_id: String,
    like_count: i64,
    scrap_count: i64,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct SurrealMembershipRow {
    subject_id: String,
    actor_id: String,
    created_at_ms: i64,
}

impl SurrealToggleStore {
    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = connect_surreal(db_config).await?;
        db.query(SCHEMA).await?.check()?;
        Ok(Self {
            client: Arc::new(db),
        })
    }

    fn table(kind: MembershipKind) -> &'static str {
        match kind {
            MembershipKind::Like => "question_like",
            MembershipKind::Scrap => "question_scrap",
        }
    }

    fn counter_field(kind: MembershipKind) -> &'static str {
        match kind {
            MembershipKind::Like => "like_count",
            MembershipKind::Scrap => "scrap_count",
        }
    }

    fn map_surreal_error(err: surrealdb::Error) -> StoreError {
        Self::map_message(&err.to_string())
    }

    fn map_message(message: &str) -> StoreError {
        let message = message.to_lowercase();
        if message.contains(SUBJECT_MISSING) {
            return StoreError::SubjectMissing;
        }
        if message.contains(MEMBERSHIP_MISSING) {
            return StoreError::NotFound;
        }
        if message.contains(COUNTER_NEGATIVE) {
            return StoreError::CounterUpdateFailed(message);
        }
        if message.contains(MEMBERSHIP_EXISTS)
            || message.contains("already exists")
            || message.contains("already contains")
            || message.contains("duplicate")
            || message.contains("unique")
        {
            return StoreError::AlreadyExists;
        }
        if message.contains("can be retried") || message.contains("write conflict") {
            return StoreError::Conflict;
        }
        StoreError::Unavailable(format!("surreal query failed: {message}"))
    }

    /// A failed transaction reports an error for every statement; the sentinel
    /// thrown by the statement that actually failed is searched across all of them.
    fn check_response(response: &mut Response) -> Result<(), StoreError> {
        let errors = response.take_errors();
        if errors.is_empty() {
            return Ok(());
        }
        let messages = errors
            .values()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(Self::map_message(&messages))
    }

    fn decode_error(err: surrealdb::Error) -> StoreError {
        StoreError::Unavailable(format!("invalid surreal result: {err}"))
    }

    fn apply_statement(kind: MembershipKind, transition: Transition) -> String {
        let table = Self::table(kind);
        let field = Self::counter_field(kind);
        let membership = match transition {
            Transition::Join => format!(
                "IF record::exists(type::thing('{table}', [$subject_id, $actor_id])) {{ THROW '{MEMBERSHIP_EXISTS}' }};
                 CREATE type::thing('{table}', [$subject_id, $actor_id]) SET
                    subject_id = $subject_id, actor_id = $actor_id, created_at_ms = $now;"
            ),
            Transition::Leave => format!(
                "IF !record::exists(type::thing('{table}', [$subject_id, $actor_id])) {{ THROW '{MEMBERSHIP_MISSING}' }};
                 DELETE type::thing('{table}', [$subject_id, $actor_id]);"
            ),
        };
        format!(
            "BEGIN TRANSACTION;
             IF !record::exists(type::thing('question', $subject_id)) {{ THROW '{SUBJECT_MISSING}' }};
             {membership}
             LET $next = (SELECT VALUE {field} FROM ONLY type::thing('question', $subject_id)) + $delta;
             IF $next < 0 {{ THROW '{COUNTER_NEGATIVE}' }};
             UPDATE type::thing('question', $subject_id) SET {field} = $next RETURN VALUE {field};
             COMMIT TRANSACTION;"
        )
    }

    async fn apply_once(
        client: Arc<Surreal<Client>>,
        key: MembershipKey,
        transition: Transition,
    ) -> Result<i64, StoreError> {
        let mut response = client
            .query(Self::apply_statement(key.kind, transition))
            .bind(("subject_id", key.subject_id))
            .bind(("actor_id", key.actor_id))
            .bind(("delta", transition.delta()))
            .bind(("now", now_ms()))
            .await
            .map_err(Self::map_surreal_error)?;
        Self::check_response(&mut response)?;
        // The counter comes from the final UPDATE; earlier statements yield NONE or records.
        for index in (0..response.num_statements()).rev() {
            let taken: Result<Option<i64>, _> = response.take(index);
            if let Ok(Some(count)) = taken {
                return Ok(count);
            }
        }
        Err(StoreError::Unavailable(
            "apply returned no counter".to_string(),
        ))
    }
}

impl MembershipStore for SurrealToggleStore {
    fn exists(&self, key: &MembershipKey) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "RETURN record::exists(type::thing('{}', [$subject_id, $actor_id]));",
                    Self::table(key.kind)
                ))
                .bind(("subject_id", key.subject_id))
                .bind(("actor_id", key.actor_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)?;
            let exists: Option<bool> = response.take(0).map_err(Self::decode_error)?;
            Ok(exists.unwrap_or(false))
        })
    }

    fn insert(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "IF !record::exists(type::thing('question', $subject_id)) {{ THROW '{SUBJECT_MISSING}' }};
                     CREATE type::thing('{table}', [$subject_id, $actor_id]) SET
                        subject_id = $subject_id, actor_id = $actor_id, created_at_ms = $now;",
                    table = Self::table(key.kind)
                ))
                .bind(("subject_id", key.subject_id))
                .bind(("actor_id", key.actor_id))
                .bind(("now", now_ms()))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)
        })
    }

    fn remove(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "DELETE type::thing('{}', [$subject_id, $actor_id]) RETURN BEFORE;",
                    Self::table(key.kind)
                ))
                .bind(("subject_id", key.subject_id))
                .bind(("actor_id", key.actor_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)?;
            let removed: Vec<SurrealMembershipRow> =
                response.take(0).map_err(Self::decode_error)?;
            if removed.is_empty() {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    fn list_by_actor(
        &self,
        kind: MembershipKind,
        actor_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Membership>, StoreError>> {
        let actor_id = actor_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT subject_id, actor_id, created_at_ms FROM {} \
                     WHERE actor_id = $actor_id ORDER BY created_at_ms DESC",
                    Self::table(kind)
                ))
                .bind(("actor_id", actor_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)?;
            let rows: Vec<SurrealMembershipRow> = response.take(0).map_err(Self::decode_error)?;
            Ok(rows
                .into_iter()
                .map(|row| Membership {
                    kind,
                    subject_id: row.subject_id,
                    actor_id: row.actor_id,
                    created_at_ms: row.created_at_ms,
                })
                .collect())
        })
    }

    fn count_for_subject(
        &self,
        kind: MembershipKind,
        subject_id: &str,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let subject_id = subject_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "RETURN array::len(SELECT VALUE id FROM {} WHERE subject_id = $subject_id);",
                    Self::table(kind)
                ))
                .bind(("subject_id", subject_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)?;
            let count: Option<i64> = response.take(0).map_err(Self::decode_error)?;
            Ok(count.unwrap_or(0))
        })
    }
}

impl SubjectStore for SurrealToggleStore {
    fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>> {
        let subject = subject.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let payload = SurrealSubjectRow {
                subject_id: subject.subject_id.clone(),
                like_count: subject.like_count,
                scrap_count: subject.scrap_count,
                created_at_ms: subject.created_at_ms,
            };
            let mut response = client
                .query("CREATE type::thing('question', $subject_id) CONTENT $payload")
                .bind(("subject_id", subject.subject_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response).map_err(|err| match err {
                StoreError::AlreadyExists => StoreError::Conflict,
                other => other,
            })?;
            Ok(subject)
        })
    }

    fn get_subject(&self, subject_id: &str) -> BoxFuture<'_, Result<Option<Subject>, StoreError>> {
        let subject_id = subject_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT subject_id, like_count, scrap_count, created_at_ms \
                     FROM type::thing('question', $subject_id)",
                )
                .bind(("subject_id", subject_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Self::check_response(&mut response)?;
            let mut rows: Vec<SurrealSubjectRow> =
                response.take(0).map_err(Self::decode_error)?;
            Ok(rows.pop().map(|row| Subject {
                subject_id: row.subject_id,
                like_count: row.like_count,
                scrap_count: row.scrap_count,
                created_at_ms: row.created_at_ms,
            }))
        })
    }
}

impl ToggleStore for SurrealToggleStore {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        let client = self.client.clone();
        Box::pin(async move {
            client
                .health()
                .await
                .map_err(|err| StoreError::Unavailable(format!("surreal health check: {err}")))
        })
    }

    fn apply(
        &self,
        key: &MembershipKey,
        transition: Transition,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let key = key.clone();
        let client = self.client.clone();
        Box::pin(async move {
            retry_on_write_conflict(APPLY_ATTEMPTS, CONFLICT_BACKOFF, || {
                Self::apply_once(client.clone(), key.clone(), transition)
            })
            .await
        })
    }
}

/// Re-runs `op` while it loses optimistic write conflicts; a conflict that outlasts
/// `attempts` is reported as unavailable.
async fn retry_on_write_conflict<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(StoreError::Conflict) if attempt < attempts => {
                tracing::debug!(attempt, "surreal write conflict, retrying transaction");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(StoreError::Conflict) => {
                return Err(StoreError::Unavailable(format!(
                    "surreal write conflict persisted after {attempts} attempts"
                )));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_sentinels_map_to_store_errors() {
        assert_eq!(
            SurrealToggleStore::map_message("An error occurred: subject_missing"),
            StoreError::SubjectMissing
        );
        assert_eq!(
            SurrealToggleStore::map_message(
                "The query was not executed due to a failed transaction; An error occurred: membership_missing"
            ),
            StoreError::NotFound
        );
        assert_eq!(
            SurrealToggleStore::map_message(
                "Database index `question_like_pair` already contains ['q-1', 'user-a']"
            ),
            StoreError::AlreadyExists
        );
        assert!(matches!(
            SurrealToggleStore::map_message("connection refused"),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn optimistic_commit_conflict_maps_to_conflict() {
        assert_eq!(
            SurrealToggleStore::map_message(
                "Failed to commit transaction due to a read or write conflict. \
                 This transaction can be retried"
            ),
            StoreError::Conflict
        );
    }

    #[tokio::test]
    async fn write_conflicts_are_retried_until_commit() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = retry_on_write_conflict(APPLY_ATTEMPTS, Duration::ZERO, || {
            let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(StoreError::Conflict)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_conflict_becomes_unavailable() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<i64, StoreError> =
            retry_on_write_conflict(3, Duration::ZERO, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(StoreError::Conflict) }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn lost_row_race_is_not_retried() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<i64, StoreError> =
            retry_on_write_conflict(APPLY_ATTEMPTS, Duration::ZERO, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(StoreError::AlreadyExists) }
            })
            .await;

        assert_eq!(result, Err(StoreError::AlreadyExists));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn leave_statement_guards_counter_and_row() {
        let statement = SurrealToggleStore::apply_statement(MembershipKind::Scrap, Transition::Leave);
        assert!(statement.starts_with("BEGIN TRANSACTION;"));
        assert!(statement.contains("scrap_count = $next"));
        assert!(statement.contains("THROW 'membership_missing'"));
        assert!(statement.contains("DELETE type::thing('question_scrap'"));
        assert!(!statement.contains("like_count"));
    }

    #[test]
    fn row_is_checked_before_counter() {
        let statement = SurrealToggleStore::apply_statement(MembershipKind::Like, Transition::Leave);
        let row_check = statement.find(MEMBERSHIP_MISSING).expect("row check");
        let counter_check = statement.find(COUNTER_NEGATIVE).expect("counter check");
        assert!(row_check < counter_check);
    }
}
