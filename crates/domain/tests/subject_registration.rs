use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use campus_domain::error::DomainError;
use campus_domain::ports::BoxFuture;
use campus_domain::ports::membership::StoreError;
use campus_domain::ports::subjects::SubjectStore;
use campus_domain::subjects::{Subject, SubjectCreate, SubjectService};

#[derive(Default)]
struct MapSubjectStore {
    subjects: Mutex<HashMap<String, Subject>>,
}

impl SubjectStore for MapSubjectStore {
    fn create_subject(&self, subject: &Subject) -> BoxFuture<'_, Result<Subject, StoreError>> {
        let subject = subject.clone();
        Box::pin(async move {
            let mut subjects = self.subjects.lock().unwrap();
            if subjects.contains_key(&subject.subject_id) {
                return Err(StoreError::Conflict);
            }
            subjects.insert(subject.subject_id.clone(), subject.clone());
            Ok(subject)
        })
    }

    fn get_subject(&self, subject_id: &str) -> BoxFuture<'_, Result<Option<Subject>, StoreError>> {
        let subject_id = subject_id.to_string();
        Box::pin(async move { Ok(self.subjects.lock().unwrap().get(&subject_id).cloned()) })
    }
}

fn service() -> SubjectService {
    SubjectService::new(Arc::new(MapSubjectStore::default()))
}

#[tokio::test]
async fn registered_subject_starts_with_zero_counters() {
    let service = service();

    let subject = service
        .register(SubjectCreate {
            subject_id: Some("  q-1 ".into()),
        })
        .await
        .unwrap();

    assert_eq!(subject.subject_id, "q-1");
    assert_eq!(subject.like_count, 0);
    assert_eq!(subject.scrap_count, 0);
    assert_eq!(service.get("q-1").await.unwrap(), subject);
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let service = service();

    let first = service.register(SubjectCreate::default()).await.unwrap();
    let second = service.register(SubjectCreate::default()).await.unwrap();

    assert_ne!(first.subject_id, second.subject_id);
    assert_eq!(first.subject_id.len(), 32);
}

#[tokio::test]
async fn duplicate_id_is_a_conflict() {
    let service = service();
    let input = SubjectCreate {
        subject_id: Some("q-1".into()),
    };

    service.register(input.clone()).await.unwrap();
    let err = service.register(input).await.unwrap_err();

    assert!(matches!(err, DomainError::Conflict));
}

#[tokio::test]
async fn unknown_subject_is_not_found() {
    let err = service().get("q-404").await.unwrap_err();

    assert!(matches!(err, DomainError::SubjectNotFound(ref id) if id == "q-404"));
}
