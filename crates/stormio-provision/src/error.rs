use thiserror::Error;

/// Failure talking to one IaaS service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("service '{0}' not present in the catalog")]
    MissingService(&'static str),

    #[error("not a valid asset provider: {0}")]
    InvalidProvider(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Which step of the provisioning procedure failed. The scheduler keys its
/// recovery on this: server-affecting codes trigger deprovisioning, the
/// lookup codes are logged and retried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionErrorCode {
    ServerCreate,
    AssociateIp,
    SettingHostName,
    FindFlavor,
    FindImage,
    ServerDetail,
    StormRegister,
}

/// Structured provisioning failure: the step that failed, the cause, and
/// whichever server id the IaaS did hand back before things went wrong.
#[derive(Debug, Error)]
#[error("provision: {code:?}: {cause}")]
pub struct ProvisionError {
    pub code: ProvisionErrorCode,
    pub server_id: Option<String>,
    pub cause: String,
}

impl ProvisionError {
    pub fn new(
        code: ProvisionErrorCode,
        server_id: Option<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self { code, server_id, cause: cause.to_string() }
    }
}
