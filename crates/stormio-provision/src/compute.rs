use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ClientError;

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_ERROR: &str = "ERROR";

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpAddress {
    #[serde(default)]
    pub version: i32,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerDetail {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<IpAddress>>,
}

/// A pool floating IP as the compute service reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct FloatingIp {
    pub id: Value,
    pub ip: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl FloatingIp {
    /// The pool API historically reports integer ids; normalise for URLs.
    pub fn id_str(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunServerOpts {
    pub name: String,
    pub flavor_id: String,
    pub image_id: String,
    pub min_count: u32,
    pub max_count: u32,
    pub metadata: HashMap<String, String>,
    /// Tenant network uuids to boot on; empty means provider default.
    pub networks: Vec<String>,
}

/// The compute operations the controller uses, against one tenant.
#[derive(Debug, Clone)]
pub struct ComputeApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ComputeApi {
    pub fn new(http: reqwest::Client, base: String, token: String) -> Self {
        Self { http, base, token }
    }

    async fn expect_success(
        url: String,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus { url, status: status.as_u16(), body });
        }
        Ok(resp)
    }

    async fn get_json(&self, url: String) -> Result<Value, ClientError> {
        let resp = self.http.get(&url).header("X-Auth-Token", &self.token).send().await?;
        Ok(Self::expect_success(url, resp).await?.json().await?)
    }

    async fn post_json(&self, url: String, body: &Value) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(&url)
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        let resp = Self::expect_success(url, resp).await?;
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    async fn put_json(&self, url: String, body: &Value) -> Result<(), ClientError> {
        let resp = self
            .http
            .put(&url)
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        Self::expect_success(url, resp).await?;
        Ok(())
    }

    async fn delete(&self, url: String) -> Result<(), ClientError> {
        let resp = self.http.delete(&url).header("X-Auth-Token", &self.token).send().await?;
        Self::expect_success(url, resp).await?;
        Ok(())
    }

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            flavors: Vec<Flavor>,
        }
        let v = self.get_json(format!("{}/flavors", self.base)).await?;
        let resp: Resp = serde_json::from_value(v).map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(resp.flavors)
    }

    pub async fn run_server(&self, opts: &RunServerOpts) -> Result<Server, ClientError> {
        let mut server = json!({
            "name": opts.name,
            "flavorRef": opts.flavor_id,
            "imageRef": opts.image_id,
            "min_count": opts.min_count,
            "max_count": opts.max_count,
            "metadata": opts.metadata,
        });
        if !opts.networks.is_empty() {
            server["networks"] = opts
                .networks
                .iter()
                .map(|uuid| json!({ "uuid": uuid }))
                .collect();
        }
        debug!(name = %opts.name, flavor = %opts.flavor_id, image = %opts.image_id, "requesting server");
        let v = self
            .post_json(format!("{}/servers", self.base), &json!({ "server": server }))
            .await?;
        serde_json::from_value(v["server"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn get_server(&self, server_id: &str) -> Result<ServerDetail, ClientError> {
        let v = self.get_json(format!("{}/servers/{}", self.base, server_id)).await?;
        serde_json::from_value(v["server"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn list_servers(&self, name: &str) -> Result<Vec<Server>, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            servers: Vec<Server>,
        }
        let url = format!("{}/servers?name={}", self.base, name);
        let v = self.get_json(url).await?;
        let resp: Resp = serde_json::from_value(v).map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(resp.servers)
    }

    pub async fn delete_server(&self, server_id: &str) -> Result<(), ClientError> {
        self.delete(format!("{}/servers/{}", self.base, server_id)).await
    }

    pub async fn rename_server(&self, server_id: &str, name: &str) -> Result<(), ClientError> {
        self.put_json(
            format!("{}/servers/{}", self.base, server_id),
            &json!({ "server": { "name": name } }),
        )
        .await
    }

    /// Stamp the externally reachable IPv4 on the server record.
    pub async fn set_ipv4_address(&self, server_id: &str, ip: &str) -> Result<(), ClientError> {
        self.put_json(
            format!("{}/servers/{}", self.base, server_id),
            &json!({ "server": { "accessIPv4": ip } }),
        )
        .await
    }

    // ── Pool floating IPs ─────────────────────────────────────────────────────

    pub async fn list_floating_ips(
        &self,
        ip_filter: Option<&str>,
    ) -> Result<Vec<FloatingIp>, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            floating_ips: Vec<FloatingIp>,
        }
        let url = match ip_filter {
            Some(ip) => format!("{}/os-floating-ips?ip={}", self.base, ip),
            None => format!("{}/os-floating-ips", self.base),
        };
        let v = self.get_json(url).await?;
        let resp: Resp = serde_json::from_value(v).map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(resp.floating_ips)
    }

    pub async fn allocate_floating_ip(&self) -> Result<FloatingIp, ClientError> {
        let v = self
            .post_json(format!("{}/os-floating-ips", self.base), &json!({}))
            .await?;
        serde_json::from_value(v["floating_ip"].clone())
            .map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn delete_floating_ip(&self, fip_id: &str) -> Result<(), ClientError> {
        self.delete(format!("{}/os-floating-ips/{}", self.base, fip_id)).await
    }

    pub async fn add_server_floating_ip(
        &self,
        server_id: &str,
        ip: &str,
    ) -> Result<(), ClientError> {
        self.post_json(
            format!("{}/servers/{}/action", self.base, server_id),
            &json!({ "addFloatingIp": { "address": ip } }),
        )
        .await
        .map(|_| ())
    }
}
