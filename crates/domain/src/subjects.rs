use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::normalize_id;
use crate::membership::{MembershipKind, map_store_error};
use crate::ports::membership::StoreError;
use crate::ports::subjects::SubjectStore;
use crate::util::{now_ms, uuid_v7_without_dashes};

/// A question that actors can like or scrap. Both counters are derived from the
/// membership tables and only move through a toggle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub subject_id: String,
    pub like_count: i64,
    pub scrap_count: i64,
    pub created_at_ms: i64,
}

impl Subject {
    pub fn new(subject_id: impl Into<String>, created_at_ms: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            like_count: 0,
            scrap_count: 0,
            created_at_ms,
        }
    }

    pub fn counter(&self, kind: MembershipKind) -> i64 {
        match kind {
            MembershipKind::Like => self.like_count,
            MembershipKind::Scrap => self.scrap_count,
        }
    }

    pub fn counter_mut(&mut self, kind: MembershipKind) -> &mut i64 {
        match kind {
            MembershipKind::Like => &mut self.like_count,
            MembershipKind::Scrap => &mut self.scrap_count,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubjectCreate {
    pub subject_id: Option<String>,
}

#[derive(Clone)]
pub struct SubjectService {
    store: Arc<dyn SubjectStore>,
}

impl SubjectService {
    pub fn new(store: Arc<dyn SubjectStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, input: SubjectCreate) -> DomainResult<Subject> {
        let subject_id = match input.subject_id.as_deref() {
            Some(subject_id) => normalize_id("subject_id", subject_id)?,
            None => uuid_v7_without_dashes(),
        };
        let subject = Subject::new(subject_id, now_ms());
        self.store
            .create_subject(&subject)
            .await
            .map_err(|err| match err {
                StoreError::Conflict => DomainError::Conflict,
                other => map_store_error(other, &subject.subject_id),
            })
    }

    pub async fn get(&self, subject_id: &str) -> DomainResult<Subject> {
        let subject_id = normalize_id("subject_id", subject_id)?;
        self.store
            .get_subject(&subject_id)
            .await
            .map_err(|err| map_store_error(err, &subject_id))?
            .ok_or(DomainError::SubjectNotFound(subject_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_selected_by_kind() {
        let mut subject = Subject::new("q-1", 0);
        *subject.counter_mut(MembershipKind::Scrap) += 1;
        assert_eq!(subject.counter(MembershipKind::Like), 0);
        assert_eq!(subject.counter(MembershipKind::Scrap), 1);
    }
}
