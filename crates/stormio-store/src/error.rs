use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// `create` with an id that already has a document.
    #[error("asset request already exists: {0}")]
    AlreadyExists(String),

    /// `find` matched no document.
    #[error("asset request not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
