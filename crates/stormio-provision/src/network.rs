use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalGatewayInfo {
    pub network_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Router {
    pub id: String,
    #[serde(default)]
    pub external_gateway_info: Option<ExternalGatewayInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeutronFloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub floating_network_id: String,
}

impl NeutronFloatingIp {
    /// The network service reports unassociated addresses with a null or
    /// empty port id, depending on version.
    pub fn is_free(&self) -> bool {
        self.port_id.as_deref().map_or(true, str::is_empty)
    }
}

/// The network-service operations the controller uses.
#[derive(Debug, Clone)]
pub struct NetworkApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl NetworkApi {
    pub fn new(http: reqwest::Client, base: String, token: String) -> Self {
        Self { http, base, token }
    }

    async fn request(
        &self,
        builder: reqwest::RequestBuilder,
        url: String,
    ) -> Result<serde_json::Value, ClientError> {
        let resp = builder.header("X-Auth-Token", &self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus { url, status: status.as_u16(), body });
        }
        Ok(resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>, ClientError> {
        let url = format!("{}/v2.0/networks", self.base);
        let v = self.request(self.http.get(&url), url).await?;
        serde_json::from_value(v["networks"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn list_routers(&self) -> Result<Vec<Router>, ClientError> {
        let url = format!("{}/v2.0/routers", self.base);
        let v = self.request(self.http.get(&url), url).await?;
        serde_json::from_value(v["routers"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>, ClientError> {
        let url = format!("{}/v2.0/ports?device_id={}", self.base, device_id);
        let v = self.request(self.http.get(&url), url).await?;
        serde_json::from_value(v["ports"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }

    /// List floating IPs, optionally filtered on wire-level query params
    /// (`floating_ip_address`, `port_id`).
    pub async fn list_floating_ips(
        &self,
        query: &[(&str, &str)],
    ) -> Result<Vec<NeutronFloatingIp>, ClientError> {
        let mut url = format!("{}/v2.0/floatingips", self.base);
        for (i, (k, v)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&format!("{k}={v}"));
        }
        let v = self.request(self.http.get(&url), url).await?;
        serde_json::from_value(v["floatingips"].clone())
            .map_err(|e| ClientError::Other(e.to_string()))
    }

    /// Allocate a floating IP on the external network, bound to a port.
    pub async fn allocate_floating_ip(
        &self,
        floating_network_id: &str,
        port_id: &str,
    ) -> Result<NeutronFloatingIp, ClientError> {
        let url = format!("{}/v2.0/floatingips", self.base);
        debug!(network = %floating_network_id, port = %port_id, "allocating floating ip");
        let body = json!({
            "floatingip": {
                "floating_network_id": floating_network_id,
                "port_id": port_id,
            }
        });
        let v = self.request(self.http.post(&url).json(&body), url).await?;
        serde_json::from_value(v["floatingip"].clone())
            .map_err(|e| ClientError::Other(e.to_string()))
    }

    /// Re-point an existing floating IP at a port.
    pub async fn associate_floating_ip(
        &self,
        fip_id: &str,
        port_id: &str,
    ) -> Result<NeutronFloatingIp, ClientError> {
        let url = format!("{}/v2.0/floatingips/{}", self.base, fip_id);
        let body = json!({ "floatingip": { "port_id": port_id } });
        let v = self.request(self.http.put(&url).json(&body), url).await?;
        serde_json::from_value(v["floatingip"].clone())
            .map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn delete_floating_ip(&self, fip_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/v2.0/floatingips/{}", self.base, fip_id);
        self.request(self.http.delete(&url), url).await.map(|_| ())
    }
}
