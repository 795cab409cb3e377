use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown request status: {0}")]
    UnknownStatus(String),
}
