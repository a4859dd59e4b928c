pub mod error;
pub mod identity;
pub mod membership;
pub mod ports;
pub mod subjects;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
