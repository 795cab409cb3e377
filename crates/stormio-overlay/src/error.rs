use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("{operation}: missing {field} in the ControlProvider")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}
