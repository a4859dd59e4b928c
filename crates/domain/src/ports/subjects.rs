use crate::ports::BoxFuture;
use crate::ports::membership::StoreError;
use crate::subjects::Subject;

pub trait SubjectStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the subject id is taken.
    fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>>;

    fn get_subject(&self, subject_id: &str) -> BoxFuture<'_, Result<Option<Subject>, StoreError>>;
}
