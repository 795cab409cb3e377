use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use stormio_domain::{AssetRequest, StormAgent};
use tracing::{debug, error};

use crate::error::OverlayError;

const AUTH_HEADER: &str = "V-Auth-Token";

/// The stormtracker URL the provisioned server boots against:
/// `scheme://{controlTokenId}@host[:port]/path`. Empty when the request
/// carries no control plane.
pub fn build_storm_data(ar: &AssetRequest) -> String {
    let raw = &ar.control_provider.stormtracker_url;
    if raw.is_empty() {
        debug!(areq = %ar.id, "stormtracker URL is absent");
        return String::new();
    }
    let url = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => {
            debug!(areq = %ar.id, url = %raw, "failed to parse the stormtracker URL");
            return String::new();
        }
    };
    let host = url.host_str().unwrap_or_default();
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    format!(
        "{}://{}@{}{}{}",
        url.scheme(),
        ar.control_token_id,
        host,
        port,
        url.path()
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct DomainAgent {
    #[serde(rename = "agentId", default)]
    agent_id: String,
}

/// Client for the overlay control plane: the tracker service holds agent
/// registrations, the light service holds domain membership. The two are
/// created and destroyed together.
#[derive(Debug, Clone, Default)]
pub struct OverlayClient {
    http: reqwest::Client,
}

impl OverlayClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Register a new agent with the tracker, then add it to the light
    /// default domain. On a domain-add failure the freshly created tracker
    /// registration is rolled back asynchronously.
    ///
    /// On success `ar.agent_id` holds the tracker-assigned id and
    /// `ar.serial_key` the server id used as serial key.
    pub async fn register_storm_agent(
        &self,
        ar: &mut AssetRequest,
        serial_key: &str,
    ) -> Result<(), OverlayError> {
        ar.server_id = serial_key.to_string();
        let req = StormAgent {
            id: ar.agent_id.clone(),
            serial_key: serial_key.to_string(),
            stoken: ar.control_token_id.clone(),
            storm_bolt: ar.control_provider.bolt.clone(),
        };

        let url = format!("{}/agents", ar.control_provider.stormtracker_url);
        debug!(areq = %ar.id, res = %ar.resource_id, %url, "registering storm agent with tracker");
        let resp = self.http.post(&url).json(&req).send().await?;
        if !matches!(resp.status(), StatusCode::OK | StatusCode::ACCEPTED) {
            return Err(OverlayError::UnexpectedStatus { url, status: resp.status().as_u16() });
        }
        let agent: StormAgent = resp.json().await?;
        ar.agent_id = agent.id;
        ar.serial_key = serial_key.to_string();
        debug!(areq = %ar.id, res = %ar.resource_id, agent = %ar.agent_id, "registered agent with tracker");

        if let Err(e) = self.domain_add_agent(ar).await {
            error!(
                areq = %ar.id,
                res = %ar.resource_id,
                agent = %ar.agent_id,
                domain = %ar.control_provider.default_domain_id,
                "failed to add agent to default domain, rolling back tracker registration"
            );
            let client = self.clone();
            let rollback = ar.clone();
            tokio::spawn(async move {
                let _ = client.de_register_storm_agent(&rollback).await;
            });
            return Err(e);
        }
        Ok(())
    }

    /// Add the agent to the light default domain. Both the light URL and
    /// the domain id must be present on the request.
    pub async fn domain_add_agent(&self, ar: &AssetRequest) -> Result<(), OverlayError> {
        let light = &ar.control_provider.stormlight_url;
        if light.is_empty() {
            return Err(OverlayError::MissingField {
                operation: "DomainAddAgent",
                field: "stormlight URL",
            });
        }
        let domain = &ar.control_provider.default_domain_id;
        if domain.is_empty() {
            return Err(OverlayError::MissingField {
                operation: "DomainAddAgent",
                field: "domain id",
            });
        }

        let url = format!("{light}/domains/{domain}/agents");
        let req = DomainAgent { agent_id: ar.agent_id.clone() };
        let resp = self
            .http
            .post(&url)
            .header(AUTH_HEADER, &ar.control_token_id)
            .json(&req)
            .send()
            .await?;
        if !matches!(resp.status(), StatusCode::OK | StatusCode::ACCEPTED) {
            return Err(OverlayError::UnexpectedStatus { url, status: resp.status().as_u16() });
        }
        debug!(areq = %ar.id, res = %ar.resource_id, agent = %ar.agent_id, "registered agent with stormlight");
        Ok(())
    }

    /// Remove the agent from the tracker. A record without an agent id is
    /// a no-op, so this is always safe to fire on deletion.
    pub async fn de_register_storm_agent(&self, ar: &AssetRequest) -> Result<(), OverlayError> {
        if ar.agent_id.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/agents/{}",
            ar.control_provider.stormtracker_url, ar.agent_id
        );
        let resp = self
            .http
            .delete(&url)
            .header(AUTH_HEADER, &ar.control_token_id)
            .send()
            .await?;
        if resp.status() != StatusCode::NO_CONTENT {
            error!(areq = %ar.id, res = %ar.resource_id, status = %resp.status(), "error deregistering storm agent");
            return Err(OverlayError::UnexpectedStatus { url, status: resp.status().as_u16() });
        }
        Ok(())
    }

    /// Remove the agent from the light default domain. A record without an
    /// agent id is a no-op.
    pub async fn domain_delete_agent(&self, ar: &AssetRequest) -> Result<(), OverlayError> {
        if ar.agent_id.is_empty() {
            debug!(areq = %ar.id, res = %ar.resource_id, "no agent id, skipping stormlight delete");
            return Ok(());
        }
        let light = &ar.control_provider.stormlight_url;
        if light.is_empty() {
            return Err(OverlayError::MissingField {
                operation: "DomainDeleteAgent",
                field: "stormlight URL",
            });
        }
        let domain = &ar.control_provider.default_domain_id;
        if domain.is_empty() {
            return Err(OverlayError::MissingField {
                operation: "DomainDeleteAgent",
                field: "domain id",
            });
        }

        let url = format!("{light}/domains/{domain}/agents/{}", ar.agent_id);
        let resp = self
            .http
            .delete(&url)
            .header(AUTH_HEADER, &ar.control_token_id)
            .send()
            .await?;
        if !matches!(resp.status(), StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Err(OverlayError::UnexpectedStatus { url, status: resp.status().as_u16() });
        }
        debug!(areq = %ar.id, res = %ar.resource_id, agent = %ar.agent_id, "deleted agent from stormlight");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormio_domain::ControlProvider;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_with_control(tracker: &str, light: &str) -> AssetRequest {
        AssetRequest {
            id: "a1".into(),
            resource_id: "r1".into(),
            control_token_id: "tok-1".into(),
            control_provider: ControlProvider {
                stormtracker_url: tracker.to_string(),
                stormlight_url: light.to_string(),
                default_domain_id: "d1".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn storm_data_embeds_token_in_tracker_url() {
        let mut ar = request_with_control("https://tracker.example.com:8443/api", "");
        ar.control_token_id = "tok-1".into();
        assert_eq!(
            build_storm_data(&ar),
            "https://tok-1@tracker.example.com:8443/api"
        );
    }

    #[test]
    fn storm_data_empty_without_tracker() {
        let ar = request_with_control("", "");
        assert_eq!(build_storm_data(&ar), "");
    }

    #[tokio::test]
    async fn register_sets_agent_id_and_adds_to_domain() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
                "id": "agent-9",
                "serialkey": "srv-1",
                "stoken": "tok-1",
                "bolt": {},
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/domains/d1/agents"))
            .and(header(AUTH_HEADER, "tok-1"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
                "agentId": "agent-9",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut ar = request_with_control(&server.uri(), &server.uri());
        OverlayClient::new()
            .register_storm_agent(&mut ar, "srv-1")
            .await
            .unwrap();

        assert_eq!(ar.agent_id, "agent-9");
        assert_eq!(ar.serial_key, "srv-1");
        assert_eq!(ar.server_id, "srv-1");
    }

    #[tokio::test]
    async fn domain_add_failure_rolls_back_tracker_registration() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "agent-9",
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/domains/d1/agents"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        // The async rollback must fire exactly one DELETE.
        Mock::given(method("DELETE"))
            .and(path("/agents/agent-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut ar = request_with_control(&server.uri(), &server.uri());
        let err = OverlayClient::new()
            .register_storm_agent(&mut ar, "srv-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnexpectedStatus { .. }));

        // Let the spawned rollback run before the mock server checks expectations.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn deregister_without_agent_is_a_noop() {
        let server = MockServer::start().await;
        // No DELETE mock mounted — any call would 404 and fail the test.
        let ar = request_with_control(&server.uri(), &server.uri());
        OverlayClient::new().de_register_storm_agent(&ar).await.unwrap();
        OverlayClient::new().domain_delete_agent(&ar).await.unwrap();
    }

    #[tokio::test]
    async fn domain_delete_accepts_204() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/domains/d1/agents/agent-9"))
            .and(header(AUTH_HEADER, "tok-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut ar = request_with_control(&server.uri(), &server.uri());
        ar.agent_id = "agent-9".into();
        OverlayClient::new().domain_delete_agent(&ar).await.unwrap();
    }

    #[tokio::test]
    async fn domain_add_requires_light_url() {
        let mut ar = request_with_control("https://tracker", "");
        ar.agent_id = "agent-9".into();
        let err = OverlayClient::new().domain_add_agent(&ar).await.unwrap_err();
        assert!(matches!(err, OverlayError::MissingField { field: "stormlight URL", .. }));
    }
}
