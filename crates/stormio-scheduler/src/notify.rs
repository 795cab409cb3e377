use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use stormio_domain::{AssetRequest, RequestStatus};
use stormio_store::AssetFilter;
use tracing::{debug, error};

use crate::error::SchedulerError;
use crate::provisioner::Provisioner;

const AUTH_HEADER: &str = "V-Auth-Token";
const AGENT_UPDATE_DELAY: Duration = Duration::from_secs(2);

/// Outcome of a caller notification; `NotFound` means the caller disowned
/// the asset and the record should be torn down.
pub(crate) enum NotifyFailure {
    NotFound,
    Other(String),
}

impl std::fmt::Display for NotifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyFailure::NotFound => write!(f, "caller reports the asset is unknown"),
            NotifyFailure::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct NotifyAsset<'a> {
    id: &'a str,
    resource: &'a str,
    instance: &'a str,
    #[serde(rename = "isActive")]
    is_active: bool,
    #[serde(rename = "ipAddress")]
    ip_address: &'a str,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    #[serde(rename = "serialKey")]
    serial_key: &'a str,
}

#[derive(Debug, Serialize)]
struct NotifyBody<'a> {
    asset: NotifyAsset<'a>,
}

#[derive(Debug, Serialize)]
struct NotifyAgent<'a> {
    #[serde(rename = "serialKey")]
    serial_key: &'a str,
}

#[derive(Debug, Serialize)]
struct ServiceAgentBody<'a> {
    #[serde(rename = "serviceAgent")]
    service_agent: NotifyAgent<'a>,
}

#[derive(Debug, Serialize)]
struct UsgTokenRequest<'a> {
    identification: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize, Default)]
struct UsgTokenResponse {
    #[serde(default)]
    token: String,
}

impl Provisioner {
    /// Push the attach notification to the caller and persist the outcome:
    /// `NotFound` downgrades the record to `MARKED_FOR_DELETION`, any other
    /// failure to `NOTIFICATION_FAILED`.
    pub(crate) async fn update_and_notify(&self, ar: &mut AssetRequest) {
        match self.notify_attach_asset(ar).await {
            Ok(()) => {}
            Err(NotifyFailure::NotFound) => ar.set_status(RequestStatus::MarkedForDeletion),
            Err(NotifyFailure::Other(_)) => ar.set_status(RequestStatus::NotificationFailed),
        }
        self.persist(ar).await;
    }

    async fn notify_attach_asset(&self, ar: &AssetRequest) -> Result<(), NotifyFailure> {
        if ar.provider.is_empty() {
            return self.notify_service_agent(ar).await;
        }

        let body = NotifyBody {
            asset: NotifyAsset {
                id: &ar.id,
                resource: &ar.resource_id,
                instance: &ar.server_id,
                is_active: true,
                ip_address: &ar.ip_address,
                agent_id: &ar.agent_id,
                serial_key: &ar.serial_key,
            },
        };
        debug!(areq = %ar.id, res = %ar.resource_id, url = %ar.notify.url, "updating the caller with asset details");
        let resp = self
            .http
            .post(&ar.notify.url)
            .header(AUTH_HEADER, &ar.notify.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyFailure::Other(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                debug!(areq = %ar.id, res = %ar.resource_id, "caller acknowledged the asset attach");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(NotifyFailure::NotFound),
            status => {
                error!(areq = %ar.id, res = %ar.resource_id, %status, "caller error on asset attach");
                Err(NotifyFailure::Other(format!("caller returned {status}")))
            }
        }
    }

    /// Agent-only requests report through the service-agent API instead:
    /// a bearer token is minted first, then the agent record is updated.
    async fn notify_service_agent(&self, ar: &AssetRequest) -> Result<(), NotifyFailure> {
        let token = self.notifier_token().await;
        if token.is_empty() {
            return Err(NotifyFailure::Other("not able to fetch a notifier token".into()));
        }

        tokio::time::sleep(AGENT_UPDATE_DELAY).await;

        let base = reqwest::Url::parse(&ar.notify.url)
            .map_err(|e| NotifyFailure::Other(format!("cannot parse the notify url: {e}")))?;
        let host = base.host_str().unwrap_or_default();
        let port = base.port().map(|p| format!(":{p}")).unwrap_or_default();
        let url = format!(
            "{}://{host}{port}/serviceAgents/{}",
            base.scheme(),
            ar.agent_id
        );

        debug!(areq = %ar.id, res = %ar.resource_id, %url, "updating the caller with agent details");
        let body = ServiceAgentBody { service_agent: NotifyAgent { serial_key: &ar.serial_key } };
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyFailure::Other(e.to_string()))?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(NotifyFailure::NotFound),
            status => {
                error!(areq = %ar.id, res = %ar.resource_id, %status, "caller error on agent update");
                Err(NotifyFailure::Other(format!("caller returned {status}")))
            }
        }
    }

    async fn notifier_token(&self) -> String {
        let body = UsgTokenRequest {
            identification: &self.config.usg_username,
            password: &self.config.usg_password,
        };
        let resp = self
            .http
            .post(&self.config.usg_authurl)
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status() == StatusCode::OK => resp
                .json::<UsgTokenResponse>()
                .await
                .map(|r| r.token)
                .unwrap_or_default(),
            Ok(resp) => {
                error!(status = %resp.status(), "cannot get a token from usg");
                String::new()
            }
            Err(e) => {
                error!(error = %e, "cannot get a token from usg");
                String::new()
            }
        }
    }

    /// Tell the caller the asset is gone: `DELETE {notify.url}/{id}`.
    pub(crate) async fn notify_detach_asset(&self, ar: &AssetRequest) -> Result<(), SchedulerError> {
        let url = format!("{}/{}", ar.notify.url, ar.id);
        let resp = self
            .http
            .delete(&url)
            .header(AUTH_HEADER, &ar.notify.token)
            .send()
            .await?;
        if !matches!(resp.status(), StatusCode::OK | StatusCode::NO_CONTENT) {
            error!(res = %ar.resource_id, %url, status = %resp.status(), "caller error on asset detach");
            return Err(SchedulerError::Notification(format!(
                "caller returned {} on detach",
                resp.status()
            )));
        }
        debug!(res = %ar.resource_id, %url, "deleted the attached asset on the caller");
        Ok(())
    }

    /// The caller reports the resource came alive: flip the record to
    /// `FUL_FILLED` (clearing any remediation flag) once the platform
    /// acknowledges the activation.
    pub(crate) async fn notify_activation(&self, resource_id: &str) -> Result<(), SchedulerError> {
        let mut ar = self
            .store
            .find(&AssetFilter::ByResourceId(resource_id.to_string()))
            .await?;
        if ar.status == RequestStatus::Fulfilled {
            error!(res = %resource_id, "resource already fulfilled");
            return Err(SchedulerError::AlreadyFulfilled(resource_id.to_string()));
        }

        if let Err(e) = self.activate_vertex_resource(resource_id).await {
            ar.set_status(RequestStatus::Retry);
            self.persist(&ar).await;
            return Err(e);
        }

        debug!(res = %resource_id, "successfully activated the resource");
        ar.set_status(RequestStatus::Fulfilled);
        ar.remediation = false;
        self.persist(&ar).await;
        Ok(())
    }

    async fn activate_vertex_resource(&self, resource_id: &str) -> Result<(), SchedulerError> {
        let url = format!("{}/resource/{}/activated", self.config.vertex_url, resource_id);
        debug!(res = %resource_id, "setting the resource into the active state");
        let resp = self.http.put(&url).send().await?;
        if resp.status() != StatusCode::OK {
            error!(res = %resource_id, status = %resp.status(), "changing the resource status failed");
            return Err(SchedulerError::Notification(format!(
                "activation endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
