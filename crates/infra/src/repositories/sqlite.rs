use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use campus_domain::membership::{Membership, MembershipKey, MembershipKind, Transition};
use campus_domain::ports::BoxFuture;
use campus_domain::ports::membership::{MembershipStore, StoreError, ToggleStore};
use campus_domain::ports::subjects::SubjectStore;
use campus_domain::subjects::Subject;
use campus_domain::util::now_ms;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, ffi, params};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS questions (
    id TEXT PRIMARY KEY,
    like_count INTEGER NOT NULL DEFAULT 0 CHECK (like_count >= 0),
    scrap_count INTEGER NOT NULL DEFAULT 0 CHECK (scrap_count >= 0),
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS likes (
    question_id TEXT NOT NULL REFERENCES questions(id),
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (question_id, user_id)
);
CREATE INDEX IF NOT EXISTS likes_user_id ON likes(user_id);
CREATE TABLE IF NOT EXISTS scraps (
    question_id TEXT NOT NULL REFERENCES questions(id),
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (question_id, user_id)
);
CREATE INDEX IF NOT EXISTS scraps_user_id ON scraps(user_id);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store. Writes go through one connection; reads use a second
/// connection on the same WAL file so they never queue behind a write transaction.
/// Both are only touched from blocking threads.
#[derive(Clone)]
pub struct SqliteToggleStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl SqliteToggleStore {
    /// Open or create a database file and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let writer = Connection::open(path).map_err(map_sqlite_error)?;
        writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?;
        configure(&writer)?;
        writer.execute_batch(SCHEMA).map_err(map_sqlite_error)?;

        let reader = Connection::open(path).map_err(map_sqlite_error)?;
        configure(&reader)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// A private in-memory database cannot be shared, so reads and writes use one connection.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        configure(&conn)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            writer: conn.clone(),
            reader: conn,
        })
    }

    fn read<T, F>(&self, op: F) -> BoxFuture<'_, Result<T, StoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        run_blocking(self.reader.clone(), op)
    }

    fn write<T, F>(&self, op: F) -> BoxFuture<'_, Result<T, StoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        run_blocking(self.writer.clone(), op)
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) {
        let conn = self.writer.lock().expect("sqlite lock");
        conn.execute_batch(sql).expect("raw sql");
    }
}

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(map_sqlite_error)
}

fn run_blocking<'a, T, F>(
    conn: Arc<Mutex<Connection>>,
    op: F,
) -> BoxFuture<'a, Result<T, StoreError>>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
{
    Box::pin(async move {
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|err| {
                StoreError::Unavailable(format!("sqlite connection poisoned: {err}"))
            })?;
            op(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("sqlite task failed: {err}")))?
    })
}

fn table(kind: MembershipKind) -> &'static str {
    match kind {
        MembershipKind::Like => "likes",
        MembershipKind::Scrap => "scraps",
    }
}

fn counter_column(kind: MembershipKind) -> &'static str {
    match kind {
        MembershipKind::Like => "like_count",
        MembershipKind::Scrap => "scrap_count",
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &err {
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return StoreError::AlreadyExists;
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return StoreError::SubjectMissing,
            ffi::SQLITE_CONSTRAINT_CHECK => {
                return StoreError::CounterUpdateFailed(
                    message.clone().unwrap_or_else(|| err.to_string()),
                );
            }
            _ => {}
        }
    }
    StoreError::Unavailable(err.to_string())
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM questions WHERE id = ?1)",
        [subject_id],
        |row| row.get(0),
    )
    .map_err(map_sqlite_error)
}

fn insert_row(conn: &Connection, key: &MembershipKey) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {} (question_id, user_id, created_at) VALUES (?1, ?2, ?3)",
        table(key.kind)
    );
    conn.execute(&sql, params![key.subject_id, key.actor_id, now_ms()])
        .map(|_| ())
        .map_err(map_sqlite_error)
}

fn delete_row(conn: &Connection, key: &MembershipKey) -> Result<(), StoreError> {
    let sql = format!(
        "DELETE FROM {} WHERE question_id = ?1 AND user_id = ?2",
        table(key.kind)
    );
    let affected = conn
        .execute(&sql, params![key.subject_id, key.actor_id])
        .map_err(map_sqlite_error)?;
    if affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

impl MembershipStore for SqliteToggleStore {
    fn exists(&self, key: &MembershipKey) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.clone();
        self.read(move |conn| {
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE question_id = ?1 AND user_id = ?2)",
                table(key.kind)
            );
            conn.query_row(&sql, params![key.subject_id, key.actor_id], |row| {
                row.get(0)
            })
            .map_err(map_sqlite_error)
        })
    }

    fn insert(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        self.write(move |conn| insert_row(conn, &key))
    }

    fn remove(&self, key: &MembershipKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.clone();
        self.write(move |conn| delete_row(conn, &key))
    }

    fn list_by_actor(
        &self,
        kind: MembershipKind,
        actor_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Membership>, StoreError>> {
        let actor_id = actor_id.to_string();
        self.read(move |conn| {
            let sql = format!(
                "SELECT question_id, user_id, created_at FROM {} \
                 WHERE user_id = ?1 ORDER BY created_at DESC, question_id",
                table(kind)
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map([&actor_id], |row| {
                    Ok(Membership {
                        kind,
                        subject_id: row.get(0)?,
                        actor_id: row.get(1)?,
                        created_at_ms: row.get(2)?,
                    })
                })
                .map_err(map_sqlite_error)?;
            let memberships = rows.collect::<Result<Vec<_>, _>>();
            memberships.map_err(map_sqlite_error)
        })
    }

    fn count_for_subject(
        &self,
        kind: MembershipKind,
        subject_id: &str,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let subject_id = subject_id.to_string();
        self.read(move |conn| {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE question_id = ?1",
                table(kind)
            );
            conn.query_row(&sql, [&subject_id], |row| row.get(0))
                .map_err(map_sqlite_error)
        })
    }
}

impl SubjectStore for SqliteToggleStore {
    fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>> {
        let subject = subject.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO questions (id, like_count, scrap_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    subject.subject_id,
                    subject.like_count,
                    subject.scrap_count,
                    subject.created_at_ms
                ],
            )
            .map_err(|err| match map_sqlite_error(err) {
                StoreError::AlreadyExists => StoreError::Conflict,
                other => other,
            })?;
            Ok(subject)
        })
    }

    fn get_subject(&self, subject_id: &str) -> BoxFuture<'_, Result<Option<Subject>, StoreError>> {
        let subject_id = subject_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, like_count, scrap_count, created_at FROM questions WHERE id = ?1",
                [&subject_id],
                |row| {
                    Ok(Subject {
                        subject_id: row.get(0)?,
                        like_count: row.get(1)?,
                        scrap_count: row.get(2)?,
                        created_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(map_sqlite_error)
        })
    }
}

impl ToggleStore for SqliteToggleStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(map_sqlite_error)
        })
    }

    fn apply(
        &self,
        key: &MembershipKey,
        transition: Transition,
    ) -> BoxFuture<'_, Result<i64, StoreError>> {
        let key = key.clone();
        self.write(move |conn| {
            // Dropping `tx` on any early return rolls the whole unit back.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            if !subject_exists(&tx, &key.subject_id)? {
                return Err(StoreError::SubjectMissing);
            }
            match transition {
                Transition::Join => insert_row(&tx, &key)?,
                Transition::Leave => delete_row(&tx, &key)?,
            }
            let column = counter_column(key.kind);
            let sql = format!(
                "UPDATE questions SET {column} = {column} + ?1 WHERE id = ?2 RETURNING {column}"
            );
            let count: i64 = tx
                .query_row(&sql, params![transition.delta(), key.subject_id], |row| {
                    row.get(0)
                })
                .map_err(map_sqlite_error)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_subject(subject_id: &str) -> SqliteToggleStore {
        let store = SqliteToggleStore::open_in_memory().expect("sqlite");
        store
            .create_subject(&Subject::new(subject_id, 0))
            .await
            .expect("subject");
        store
    }

    #[tokio::test]
    async fn primary_key_rejects_second_row() {
        let store = store_with_subject("q-1").await;
        let key = MembershipKey::new(MembershipKind::Like, "q-1", "user-a");

        store.insert(&key).await.unwrap();

        assert_eq!(store.insert(&key).await, Err(StoreError::AlreadyExists));
        assert_eq!(
            store.count_for_subject(MembershipKind::Like, "q-1").await,
            Ok(1)
        );
    }

    #[tokio::test]
    async fn foreign_key_rejects_unknown_subject() {
        let store = SqliteToggleStore::open_in_memory().unwrap();
        let key = MembershipKey::new(MembershipKind::Scrap, "q-404", "user-a");
        assert_eq!(store.insert(&key).await, Err(StoreError::SubjectMissing));
        assert_eq!(
            store.apply(&key, Transition::Join).await,
            Err(StoreError::SubjectMissing)
        );
    }

    #[tokio::test]
    async fn apply_moves_row_and_counter_together() {
        let store = store_with_subject("q-1").await;
        let key = MembershipKey::new(MembershipKind::Scrap, "q-1", "user-a");

        assert_eq!(store.apply(&key, Transition::Join).await, Ok(1));
        assert_eq!(
            store.apply(&key, Transition::Join).await,
            Err(StoreError::AlreadyExists)
        );

        let subject = store.get_subject("q-1").await.unwrap().unwrap();
        assert_eq!(subject.scrap_count, 1);
        assert_eq!(subject.like_count, 0);

        assert_eq!(store.apply(&key, Transition::Leave).await, Ok(0));
        assert_eq!(
            store.apply(&key, Transition::Leave).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn check_violation_rolls_back_membership_delete() {
        let store = store_with_subject("q-1").await;
        let key = MembershipKey::new(MembershipKind::Like, "q-1", "user-a");
        store.apply(&key, Transition::Join).await.unwrap();
        store.execute_raw("UPDATE questions SET like_count = 0 WHERE id = 'q-1';");

        let err = store.apply(&key, Transition::Leave).await.unwrap_err();

        assert!(matches!(err, StoreError::CounterUpdateFailed(_)));
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn lists_memberships_of_one_actor() {
        let store = store_with_subject("q-1").await;
        store
            .create_subject(&Subject::new("q-2", 0))
            .await
            .unwrap();
        for (subject, actor) in [("q-1", "user-a"), ("q-2", "user-a"), ("q-1", "user-b")] {
            let key = MembershipKey::new(MembershipKind::Like, subject, actor);
            store.apply(&key, Transition::Join).await.unwrap();
        }

        let listed = store
            .list_by_actor(MembershipKind::Like, "user-a")
            .await
            .unwrap();

        let mut subjects = listed
            .iter()
            .map(|membership| membership.subject_id.as_str())
            .collect::<Vec<_>>();
        subjects.sort_unstable();
        assert_eq!(subjects, vec!["q-1", "q-2"]);
        assert!(
            store
                .list_by_actor(MembershipKind::Scrap, "user-a")
                .await
                .unwrap()
                .is_empty()
        );
    }

    struct TempDb(std::path::PathBuf);

    impl TempDb {
        fn new(label: &str) -> Self {
            let name = format!("campus-{label}-{}-{}.db", std::process::id(), now_ms());
            Self(std::env::temp_dir().join(name))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_the_writer() {
        let db = TempDb::new("reader");
        let store = SqliteToggleStore::open(&db.0).expect("sqlite file");
        store
            .create_subject(&Subject::new("q-1", 0))
            .await
            .unwrap();
        let key = MembershipKey::new(MembershipKind::Like, "q-1", "user-a");
        store.apply(&key, Transition::Join).await.unwrap();

        let writer = store.writer.lock().expect("writer lock");
        let subject = tokio::time::timeout(Duration::from_secs(2), store.get_subject("q-1"))
            .await
            .expect("read finished while the writer was held")
            .unwrap()
            .unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(2), store.exists(&key))
            .await
            .expect("read finished while the writer was held")
            .unwrap();
        drop(writer);

        assert_eq!(subject.like_count, 1);
        assert!(joined);
    }
}
