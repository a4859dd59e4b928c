use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;

pub const MAX_ID_LENGTH: usize = 128;

/// Opaque caller identity, verified upstream and passed explicitly into every call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorIdentity {
    pub actor_id: String,
}

impl ActorIdentity {
    pub fn new(actor_id: impl Into<String>) -> DomainResult<Self> {
        let actor_id = normalize_id("actor_id", &actor_id.into())?;
        Ok(Self { actor_id })
    }
}

pub fn normalize_id(field: &str, value: &str) -> DomainResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    if value.chars().count() > MAX_ID_LENGTH {
        return Err(DomainError::Validation(format!(
            "{field} exceeds max length of {MAX_ID_LENGTH}"
        )));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_id_is_trimmed() {
        let actor = ActorIdentity::new("  user-7 ").unwrap();
        assert_eq!(actor.actor_id, "user-7");
    }

    #[test]
    fn blank_actor_id_is_rejected() {
        assert!(matches!(
            ActorIdentity::new("   "),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn overlong_id_is_rejected() {
        let long = "x".repeat(MAX_ID_LENGTH + 1);
        assert!(normalize_id("subject_id", &long).is_err());
        assert!(normalize_id("subject_id", &"x".repeat(MAX_ID_LENGTH)).is_ok());
    }
}
