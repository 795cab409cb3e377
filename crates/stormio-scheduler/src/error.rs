use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no valid asset provider credentials")]
    InvalidProvider,

    #[error("store error: {0}")]
    Store(#[from] stormio_store::StoreError),

    #[error("provisioning failed after retries")]
    RetriesExhausted,

    #[error("resource {0} is already fulfilled")]
    AlreadyFulfilled(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Notification(String),
}
