use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::compute::ComputeApi;
use crate::error::ClientError;
use crate::network::NetworkApi;

/// Addresses reserved for in-flight replacements. Membership means "do not
/// garbage-collect this floating IP, a remediated request will re-claim it".
#[derive(Debug, Default)]
pub struct RemediationList {
    inner: Mutex<HashMap<String, String>>,
}

impl RemediationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, fip: &str) {
        self.inner.lock().unwrap().insert(fip.to_string(), fip.to_string());
    }

    pub fn delete(&self, fip: &str) {
        self.inner.lock().unwrap().remove(fip);
    }

    pub fn find(&self, fip: &str) -> bool {
        self.inner.lock().unwrap().contains_key(fip)
    }
}

/// One contract over the two floating-IP back ends. The strategy is chosen
/// when the facade is constructed and never changes afterwards.
#[async_trait]
pub trait FloatingIpService: Send + Sync {
    /// How many more floating IPs this tenant may attach.
    async fn check_availability(&self) -> Result<i64, ClientError>;

    /// Allocate an address and bind it to the server.
    async fn attach(&self, server_id: &str) -> Result<String, ClientError>;

    /// Release the address back to the tenant.
    async fn detach(&self, ip: &str) -> Result<(), ClientError>;

    /// Re-bind a reserved address to a replacement server, falling back to
    /// a fresh [`attach`](Self::attach) when the address is gone.
    async fn retain(&self, server_id: &str, ip: &str) -> Result<String, ClientError>;

    fn remediation(&self) -> &RemediationList;

    fn track(&self, ip: &str) {
        self.remediation().track(ip);
    }

    fn delete(&self, ip: &str) {
        self.remediation().delete(ip);
    }

    fn find(&self, ip: &str) -> bool {
        self.remediation().find(ip)
    }
}

// ── Pool strategy ─────────────────────────────────────────────────────────────

/// Legacy pool-based management on the compute service.
pub struct PoolFipService {
    compute: Arc<ComputeApi>,
    maximum_fip: i64,
    remediation: Arc<RemediationList>,
}

impl PoolFipService {
    pub fn new(compute: Arc<ComputeApi>, maximum_fip: i64, remediation: Arc<RemediationList>) -> Self {
        Self { compute, maximum_fip, remediation }
    }

    /// Delete every pool address that is unattached and not reserved for a
    /// remediation, freeing quota for the retry.
    async fn release_free_addresses(&self) {
        let Ok(ips) = self.compute.list_floating_ips(None).await else { return };
        for fip in ips {
            if self.remediation.find(&fip.ip) {
                continue;
            }
            if fip.instance_id.is_none() {
                let _ = self.compute.delete_floating_ip(&fip.id_str()).await;
            }
        }
    }
}

#[async_trait]
impl FloatingIpService for PoolFipService {
    async fn check_availability(&self) -> Result<i64, ClientError> {
        let ips = self.compute.list_floating_ips(None).await?;
        let consumed = ips.iter().filter(|ip| ip.instance_id.is_some()).count() as i64;
        Ok(self.maximum_fip - consumed)
    }

    async fn attach(&self, server_id: &str) -> Result<String, ClientError> {
        for _ in 0..2 {
            let fip = match self.compute.allocate_floating_ip().await {
                Ok(fip) => fip,
                Err(e) => {
                    debug!(error = %e, "failed to allocate fip on demand, releasing free ones and retrying");
                    self.release_free_addresses().await;
                    continue;
                }
            };
            debug!(ip = %fip.ip, "floating ip allocated");
            if let Err(e) = self.compute.set_ipv4_address(server_id, &fip.ip).await {
                error!(error = %e, "failed to set accessIPv4 address");
                let _ = self.compute.delete_floating_ip(&fip.id_str()).await;
                return Err(ClientError::Other(
                    "failed to attach access IP with floating IP".into(),
                ));
            }
            if let Err(e) = self.compute.add_server_floating_ip(server_id, &fip.ip).await {
                error!(error = %e, "failed to attach floating ip");
                let _ = self.compute.delete_floating_ip(&fip.id_str()).await;
                return Err(ClientError::Other("failed to attach floating IP".into()));
            }
            return Ok(fip.ip);
        }
        Err(ClientError::Other("no floating IPs found".into()))
    }

    async fn detach(&self, ip: &str) -> Result<(), ClientError> {
        let fips = self.compute.list_floating_ips(Some(ip)).await?;
        for fip in fips {
            if fip.ip == ip {
                debug!(ip = %fip.ip, "deleting the floating ip");
                return self.compute.delete_floating_ip(&fip.id_str()).await;
            }
        }
        Err(ClientError::NotFound(format!("floating ip {ip}")))
    }

    async fn retain(&self, server_id: &str, ip: &str) -> Result<String, ClientError> {
        debug!(%ip, server = %server_id, "remediation request, trying to retain the old ip");
        let available = self
            .compute
            .list_floating_ips(None)
            .await
            .map(|ips| ips.iter().any(|fip| fip.ip == ip))
            .unwrap_or(false);

        if !available {
            debug!(%ip, "old ip no longer in the pool, attaching a fresh one");
            self.remediation.delete(ip);
            return self.attach(server_id).await;
        }

        // accessIPv4 is best effort here; the attach result is authoritative.
        let _ = self.compute.set_ipv4_address(server_id, ip).await;
        if let Err(e) = self.compute.add_server_floating_ip(server_id, ip).await {
            warn!(%ip, error = %e, "retain on the old ip failed, attaching a fresh one");
            self.remediation.delete(ip);
            return self.attach(server_id).await;
        }
        self.remediation.delete(ip);
        Ok(ip.to_string())
    }

    fn remediation(&self) -> &RemediationList {
        &self.remediation
    }
}

// ── Port strategy ─────────────────────────────────────────────────────────────

/// Port-association management on the network service.
pub struct PortFipService {
    network: Arc<NetworkApi>,
    remediation: Arc<RemediationList>,
}

impl PortFipService {
    pub fn new(network: Arc<NetworkApi>, remediation: Arc<RemediationList>) -> Self {
        Self { network, remediation }
    }

    /// The external network is whichever one a router gateways to.
    async fn external_network(&self) -> Result<String, ClientError> {
        let routers = self.network.list_routers().await?;
        for router in routers {
            if let Some(gateway) = router.external_gateway_info {
                debug!(network = %gateway.network_id, "external network identified");
                return Ok(gateway.network_id);
            }
        }
        Err(ClientError::NotFound("external network".into()))
    }

    async fn server_port(&self, server_id: &str) -> Result<Option<String>, ClientError> {
        let ports = self.network.list_ports(server_id).await?;
        Ok(ports.into_iter().find(|p| p.device_id == server_id).map(|p| p.id))
    }
}

#[async_trait]
impl FloatingIpService for PortFipService {
    async fn check_availability(&self) -> Result<i64, ClientError> {
        // Quota enforcement is off for this back end.
        Ok(0)
    }

    async fn attach(&self, server_id: &str) -> Result<String, ClientError> {
        let ext_net = self.external_network().await?;

        for _ in 0..2 {
            let Some(port_id) = self.server_port(server_id).await? else {
                error!(server = %server_id, "no port found for the server");
                return Err(ClientError::NotFound(format!("port for server {server_id}")));
            };

            match self.network.allocate_floating_ip(&ext_net, &port_id).await {
                Ok(fip) => return Ok(fip.floating_ip_address),
                Err(e) => {
                    debug!(error = %e, "floating ip allocation failed, releasing free addresses");
                    if let Ok(fips) = self.network.list_floating_ips(&[("port_id", "")]).await {
                        for fip in fips.iter().filter(|f| f.is_free()) {
                            let _ = self.network.delete_floating_ip(&fip.id).await;
                        }
                    }
                }
            }
        }
        Err(ClientError::Other("failed to allocate fip".into()))
    }

    async fn detach(&self, ip: &str) -> Result<(), ClientError> {
        let fips = self
            .network
            .list_floating_ips(&[("floating_ip_address", ip)])
            .await?;
        if fips.len() == 1 {
            debug!(id = %fips[0].id, "deleting the floating ip");
            return self.network.delete_floating_ip(&fips[0].id).await;
        }
        Err(ClientError::NotFound(format!("floating ip {ip}")))
    }

    async fn retain(&self, server_id: &str, ip: &str) -> Result<String, ClientError> {
        let port = self.server_port(server_id).await?;
        let Some(port_id) = port else {
            self.remediation.delete(ip);
            return self.attach(server_id).await;
        };

        let fips = self
            .network
            .list_floating_ips(&[("port_id", ""), ("floating_ip_address", ip)])
            .await
            .unwrap_or_default();
        let reserved = fips
            .iter()
            .find(|f| f.is_free() && f.floating_ip_address == ip);

        match reserved {
            Some(fip) => match self.network.associate_floating_ip(&fip.id, &port_id).await {
                Ok(bound) => {
                    self.remediation.delete(ip);
                    Ok(bound.floating_ip_address)
                }
                Err(e) => {
                    warn!(%ip, error = %e, "failed to re-associate the reserved ip, attaching a fresh one");
                    self.remediation.delete(ip);
                    self.attach(server_id).await
                }
            },
            None => {
                debug!(%ip, "reserved ip is gone or in use, attaching a fresh one");
                self.remediation.delete(ip);
                self.attach(server_id).await
            }
        }
    }

    fn remediation(&self) -> &RemediationList {
        &self.remediation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn compute(server: &MockServer) -> Arc<ComputeApi> {
        Arc::new(ComputeApi::new(reqwest::Client::new(), server.uri(), "tok".into()))
    }

    fn network(server: &MockServer) -> Arc<NetworkApi> {
        Arc::new(NetworkApi::new(reqwest::Client::new(), server.uri(), "tok".into()))
    }

    #[tokio::test]
    async fn pool_attach_allocates_and_binds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ip": { "id": 7, "ip": "10.0.0.5", "instance_id": null }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/servers/srv-1"))
            .and(body_partial_json(json!({ "server": { "accessIPv4": "10.0.0.5" } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers/srv-1/action"))
            .and(body_partial_json(json!({ "addFloatingIp": { "address": "10.0.0.5" } })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let svc = PoolFipService::new(compute(&server), 10, Arc::new(RemediationList::new()));
        let ip = svc.attach("srv-1").await.unwrap();
        assert_eq!(ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn pool_attach_releases_free_addresses_before_retrying() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ips": [
                    { "id": 1, "ip": "10.0.0.1", "instance_id": null },
                    { "id": 2, "ip": "10.0.0.2", "instance_id": "srv-9" },
                    { "id": 3, "ip": "10.0.0.3", "instance_id": null }
                ]
            })))
            .mount(&server)
            .await;
        // Only the free, untracked address may be garbage-collected.
        Mock::given(method("DELETE"))
            .and(path("/os-floating-ips/1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(2)
            .mount(&server)
            .await;

        let remediation = Arc::new(RemediationList::new());
        remediation.track("10.0.0.3");
        let svc = PoolFipService::new(compute(&server), 10, remediation);
        let err = svc.attach("srv-1").await.unwrap_err();
        assert!(err.to_string().contains("no floating IPs found"));
    }

    #[tokio::test]
    async fn pool_availability_is_ceiling_minus_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ips": [
                    { "id": 1, "ip": "10.0.0.1", "instance_id": "a" },
                    { "id": 2, "ip": "10.0.0.2", "instance_id": null },
                    { "id": 3, "ip": "10.0.0.3", "instance_id": "b" }
                ]
            })))
            .mount(&server)
            .await;

        let svc = PoolFipService::new(compute(&server), 10, Arc::new(RemediationList::new()));
        assert_eq!(svc.check_availability().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn pool_retain_rebinds_and_clears_reservation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ips": [ { "id": 7, "ip": "10.0.0.5", "instance_id": null } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/servers/srv-2"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers/srv-2/action"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let remediation = Arc::new(RemediationList::new());
        remediation.track("10.0.0.5");
        let svc = PoolFipService::new(compute(&server), 10, remediation.clone());

        let ip = svc.retain("srv-2", "10.0.0.5").await.unwrap();
        assert_eq!(ip, "10.0.0.5");
        assert!(!remediation.find("10.0.0.5"));
    }

    #[tokio::test]
    async fn pool_detach_deletes_exact_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .and(query_param("ip", "10.0.0.5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ips": [ { "id": 7, "ip": "10.0.0.5", "instance_id": "srv-1" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/os-floating-ips/7"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let svc = PoolFipService::new(compute(&server), 10, Arc::new(RemediationList::new()));
        svc.detach("10.0.0.5").await.unwrap();
    }

    #[tokio::test]
    async fn port_attach_goes_through_router_and_port() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/routers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "routers": [
                    { "id": "r0", "external_gateway_info": null },
                    { "id": "r1", "external_gateway_info": { "network_id": "ext-net" } }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.0/ports"))
            .and(query_param("device_id", "srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ports": [ { "id": "port-1", "device_id": "srv-1" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.0/floatingips"))
            .and(body_partial_json(json!({
                "floatingip": { "floating_network_id": "ext-net", "port_id": "port-1" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "floatingip": {
                    "id": "fip-1", "floating_ip_address": "172.24.4.8",
                    "port_id": "port-1", "floating_network_id": "ext-net"
                }
            })))
            .mount(&server)
            .await;

        let svc = PortFipService::new(network(&server), Arc::new(RemediationList::new()));
        let ip = svc.attach("srv-1").await.unwrap();
        assert_eq!(ip, "172.24.4.8");
    }

    #[tokio::test]
    async fn port_availability_reports_zero() {
        let server = MockServer::start().await;
        let svc = PortFipService::new(network(&server), Arc::new(RemediationList::new()));
        assert_eq!(svc.check_availability().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn port_retain_associates_reserved_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/ports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ports": [ { "id": "port-2", "device_id": "srv-2" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.0/floatingips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floatingips": [ {
                    "id": "fip-1", "floating_ip_address": "172.24.4.8",
                    "port_id": null, "floating_network_id": "ext-net"
                } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2.0/floatingips/fip-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floatingip": {
                    "id": "fip-1", "floating_ip_address": "172.24.4.8",
                    "port_id": "port-2", "floating_network_id": "ext-net"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let remediation = Arc::new(RemediationList::new());
        remediation.track("172.24.4.8");
        let svc = PortFipService::new(network(&server), remediation.clone());

        let ip = svc.retain("srv-2", "172.24.4.8").await.unwrap();
        assert_eq!(ip, "172.24.4.8");
        assert!(!remediation.find("172.24.4.8"));
    }
}
