use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stormio_domain::{AssetProvider, AssetRequest};
use stormio_overlay::{build_storm_data, OverlayClient};
use tracing::{debug, error, info, warn};

use crate::compute::{ComputeApi, RunServerOpts, Server, STATUS_ACTIVE, STATUS_ERROR};
use crate::error::{ClientError, ProvisionError, ProvisionErrorCode};
use crate::fip::{FloatingIpService, PoolFipService, PortFipService, RemediationList};
use crate::identity::authenticate;
use crate::image::{ImageApi, ImageDetail};
use crate::network::NetworkApi;

const SERVER_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Operator-level knobs the facade needs beyond tenant credentials.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub signer_id: String,
    pub nexus_url: String,
    /// Seconds to let the hypervisor settle before networking calls.
    pub delay_between_os_calls: u64,
    /// Pool-strategy floating-IP ceiling.
    pub maximum_fip: i64,
}

/// Reverse PTR lookup — injectable so tests never touch a real resolver.
#[async_trait]
pub(crate) trait ReverseResolver: Send + Sync {
    async fn lookup(&self, ip: &str) -> Option<String>;
}

/// System-resolver lookup, off the async runtime.
struct SystemResolver;

#[async_trait]
impl ReverseResolver for SystemResolver {
    async fn lookup(&self, ip: &str) -> Option<String> {
        let addr: std::net::IpAddr = ip.parse().ok()?;
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr).ok())
            .await
            .ok()
            .flatten()
    }
}

/// IaaS facade for one tenant: authenticates once at construction, owns the
/// compute/image/network clients and the floating-IP strategy.
pub struct ServiceProvision {
    compute: Arc<ComputeApi>,
    image: ImageApi,
    floating: Box<dyn FloatingIpService>,
    overlay: OverlayClient,
    options: ProvisionOptions,
    resolver: Box<dyn ReverseResolver>,
}

impl ServiceProvision {
    /// Authenticate and probe the tenant. The floating-IP strategy is fixed
    /// here for the facade's lifetime: tenants exposing at least one network
    /// through the network service get port association, everyone else gets
    /// the legacy pool.
    pub async fn connect(
        provider: &AssetProvider,
        options: ProvisionOptions,
        overlay: OverlayClient,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::new();
        let session = authenticate(&http, provider).await?;

        let compute = Arc::new(ComputeApi::new(
            http.clone(),
            session.endpoints.compute.clone(),
            session.token.clone(),
        ));
        let image = ImageApi::new(
            http.clone(),
            session.endpoints.image.clone(),
            session.token.clone(),
        );

        let remediation = Arc::new(RemediationList::new());
        let floating: Box<dyn FloatingIpService> = match &session.endpoints.network {
            Some(base) => {
                let network = Arc::new(NetworkApi::new(http.clone(), base.clone(), session.token.clone()));
                match network.list_networks().await {
                    Ok(networks) if !networks.is_empty() => {
                        info!(count = networks.len(), "tenant exposes networks, using port association");
                        Box::new(PortFipService::new(network, remediation))
                    }
                    _ => Box::new(PoolFipService::new(
                        compute.clone(),
                        options.maximum_fip,
                        remediation,
                    )),
                }
            }
            None => Box::new(PoolFipService::new(
                compute.clone(),
                options.maximum_fip,
                remediation,
            )),
        };

        Ok(Self {
            compute,
            image,
            floating,
            overlay,
            options,
            resolver: Box::new(SystemResolver),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_resolver(mut self, resolver: Box<dyn ReverseResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Credential probe: a tenant that cannot list flavors is not usable.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.compute.list_flavors().await {
            Ok(flavors) if !flavors.is_empty() => Ok(()),
            Ok(_) => Err(ClientError::InvalidProvider("no flavors visible".into())),
            Err(e) => {
                error!(error = %e, "not a valid asset provider");
                Err(ClientError::InvalidProvider(e.to_string()))
            }
        }
    }

    pub fn floating_service(&self) -> &dyn FloatingIpService {
        self.floating.as_ref()
    }

    pub async fn check_availability(&self) -> Result<i64, ClientError> {
        self.floating.check_availability().await
    }

    /// Bring up one server for the request: boot, wait for ACTIVE, bind a
    /// floating IP, reverse-resolve the hostname, and register the overlay
    /// agent. Returns `(server_id, floating_ip)`.
    pub async fn provision_instance(
        &self,
        ar: &mut AssetRequest,
    ) -> Result<(String, String), ProvisionError> {
        debug!(areq = %ar.id, res = %ar.resource_id, "provisioning an instance");

        let mut metadata = HashMap::new();
        metadata.insert("signerId".to_string(), self.options.signer_id.clone());
        metadata.insert("nexusUrl".to_string(), self.options.nexus_url.clone());
        let stormdata = build_storm_data(ar);
        metadata.insert("stormtracker".to_string(), stormdata.clone());

        let opts = RunServerOpts {
            name: ar.host_name.clone(),
            flavor_id: ar.model.flavor.clone(),
            image_id: ar.model.image.clone(),
            min_count: 1,
            max_count: 1,
            metadata,
            networks: ar
                .model
                .networks
                .iter()
                .filter_map(|n| n.get("uuid").cloned())
                .collect(),
        };
        let entity = self.compute.run_server(&opts).await.map_err(|e| {
            error!(areq = %ar.id, error = %e, "unable to create the server");
            ProvisionError::new(ProvisionErrorCode::ServerCreate, None, e)
        })?;
        let server_id = entity.id;

        let delayed_unit = self.wait_server_to_start(&server_id).await.map_err(|e| {
            ProvisionError::new(ProvisionErrorCode::ServerCreate, Some(server_id.clone()), e)
        })?;

        tokio::time::sleep(Duration::from_secs(self.guess_delay(delayed_unit))).await;

        let mut fip = if ar.remediation {
            self.floating.retain(&server_id, &ar.ip_address).await
        } else {
            self.floating.attach(&server_id).await
        }
        .unwrap_or_else(|e| {
            warn!(areq = %ar.id, error = %e, "could not associate a floating ip, continuing");
            String::new()
        });

        if !fip.is_empty() {
            if let Some(ptr) = self.resolver.lookup(&fip).await {
                if let Err(e) = self.compute.rename_server(&server_id, &ptr).await {
                    warn!(areq = %ar.id, host = %ptr, error = %e, "could not set the resolved hostname");
                }
            }
        }

        let detail = self.compute.get_server(&server_id).await.map_err(|e| {
            ProvisionError::new(ProvisionErrorCode::ServerDetail, Some(server_id.clone()), e)
        })?;

        // Address priority: public, then private, then whatever the cloud
        // labeled its only network.
        let addresses = detail
            .addresses
            .get("public")
            .filter(|a| !a.is_empty())
            .or_else(|| detail.addresses.get("private").filter(|a| !a.is_empty()))
            .or_else(|| detail.addresses.values().find(|a| !a.is_empty()));

        if fip.is_empty() {
            if let Some(addresses) = addresses {
                fip = addresses
                    .get(1)
                    .or_else(|| addresses.first())
                    .map(|a| a.addr.clone())
                    .unwrap_or_default();
            }
        }
        if fip.is_empty() {
            return Err(ProvisionError::new(
                ProvisionErrorCode::AssociateIp,
                Some(server_id),
                "unable to allocate floating ip",
            ));
        }

        if !stormdata.is_empty() {
            debug!(areq = %ar.id, res = %ar.resource_id, "about to register with the tracker");
            if let Err(e) = self.overlay.register_storm_agent(ar, &server_id).await {
                debug!(areq = %ar.id, error = %e, "unable to register the storm agent");
                return Err(ProvisionError::new(
                    ProvisionErrorCode::StormRegister,
                    Some(server_id),
                    e,
                ));
            }
        }

        Ok((server_id, fip))
    }

    /// Tear the request's server down. A remediation request parks its
    /// floating IP in the remediation set first so the replacement can
    /// re-claim the address.
    pub async fn deprovision_instance(&self, ar: &AssetRequest) -> Result<(), ClientError> {
        if ar.remediation && !ar.ip_address.is_empty() {
            let _ = self.floating.detach(&ar.ip_address).await;
            self.floating.track(&ar.ip_address);
        }
        if let Err(e) = self.compute.delete_server(&ar.server_id).await {
            debug!(areq = %ar.id, res = %ar.resource_id, server = %ar.server_id, error = %e, "failed to delete the server");
            return Err(e);
        }
        Ok(())
    }

    /// Find the request's server by name, verifying the id still matches.
    pub async fn get_server(&self, name: &str, server_id: &str) -> Result<Server, ClientError> {
        debug!(%name, "getting the server details");
        let servers = self.compute.list_servers(name).await.unwrap_or_default();
        servers
            .into_iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| ClientError::NotFound(format!("server {server_id}")))
    }

    pub async fn rename_server(&self, server_id: &str, name: &str) -> Result<(), ClientError> {
        self.compute.rename_server(server_id, name).await
    }

    pub async fn list_flavor_names(&self) -> Result<HashMap<String, String>, ClientError> {
        let flavors = self.compute.list_flavors().await?;
        Ok(flavors.into_iter().map(|f| (f.id, f.name)).collect())
    }

    pub async fn list_image_names(&self) -> Result<HashMap<String, String>, ClientError> {
        let images = self.image.list_images().await?;
        Ok(images.into_iter().map(|i| (i.id, i.name)).collect())
    }

    pub async fn upload_image(
        &self,
        meta_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<ImageDetail, ClientError> {
        self.image.upload_image(meta_headers, body).await
    }

    /// Poll until the server leaves the boot state. Counts poll rounds as
    /// the "delayed unit" fed into [`guess_delay`](Self::guess_delay).
    async fn wait_server_to_start(&self, server_id: &str) -> Result<u64, ClientError> {
        let mut delayed_unit = 1u64;
        info!(server = %server_id, "waiting for the server to start");
        loop {
            let server = self.compute.get_server(server_id).await?;
            match server.status.as_str() {
                STATUS_ACTIVE => {
                    info!(server = %server_id, "started");
                    return Ok(delayed_unit);
                }
                STATUS_ERROR => {
                    return Err(ClientError::Other(format!(
                        "server {server_id} entered ERROR while booting"
                    )));
                }
                status => {
                    debug!(server = %server_id, %status, "server not ready, polling again in 10 seconds");
                }
            }
            tokio::time::sleep(SERVER_POLL_INTERVAL).await;
            delayed_unit += 1;
        }
    }

    /// The longer the boot took, the longer networking gets to settle.
    fn guess_delay(&self, delayed_unit: u64) -> u64 {
        if delayed_unit == 1 {
            self.options.delay_between_os_calls
        } else {
            self.options.delay_between_os_calls + delayed_unit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoPtr;

    #[async_trait]
    impl ReverseResolver for NoPtr {
        async fn lookup(&self, _ip: &str) -> Option<String> {
            None
        }
    }

    struct FixedPtr(&'static str);

    #[async_trait]
    impl ReverseResolver for FixedPtr {
        async fn lookup(&self, _ip: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn provider(endpoint: &str) -> AssetProvider {
        AssetProvider {
            username: "u".into(),
            password: "p".into(),
            tenant: "t".into(),
            endpoint_url: endpoint.to_string(),
            ..Default::default()
        }
    }

    fn catalog(base: &str, with_network: bool) -> serde_json::Value {
        let mut services = vec![
            json!({ "type": "compute", "endpoints": [ { "publicURL": base, "region": "" } ] }),
            json!({ "type": "image", "endpoints": [ { "publicURL": base, "region": "" } ] }),
        ];
        if with_network {
            services.push(json!({
                "type": "network", "endpoints": [ { "publicURL": base, "region": "" } ]
            }));
        }
        json!({ "access": { "token": { "id": "tok" }, "serviceCatalog": services } })
    }

    async fn mount_identity(server: &MockServer, with_network: bool) {
        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(catalog(&server.uri(), with_network)),
            )
            .mount(server)
            .await;
    }

    async fn connect(server: &MockServer, with_network: bool) -> ServiceProvision {
        mount_identity(server, with_network).await;
        let options = ProvisionOptions { delay_between_os_calls: 0, maximum_fip: 10, ..Default::default() };
        ServiceProvision::connect(&provider(&server.uri()), options, OverlayClient::new())
            .await
            .unwrap()
            .with_resolver(Box::new(NoPtr))
    }

    #[tokio::test]
    async fn tenant_without_networks_uses_the_pool_strategy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "networks": [] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "floating_ips": [] })))
            .mount(&server)
            .await;

        let svc = connect(&server, true).await;
        // Pool availability = ceiling − attached; port strategy would report 0.
        assert_eq!(svc.check_availability().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn tenant_with_networks_uses_the_port_strategy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "networks": [ { "id": "net-1", "name": "tenant-net" } ]
            })))
            .mount(&server)
            .await;

        let svc = connect(&server, true).await;
        assert_eq!(svc.check_availability().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ping_rejects_a_tenant_without_flavors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flavors"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "flavors": [] })))
            .mount(&server)
            .await;

        let svc = connect(&server, false).await;
        assert!(matches!(svc.ping().await, Err(ClientError::InvalidProvider(_))));
    }

    async fn mount_happy_compute(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": { "id": "srv-1", "name": "h1" }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {
                    "id": "srv-1", "name": "h1", "status": "ACTIVE",
                    "addresses": { "private": [ { "version": 4, "addr": "192.168.0.4" } ] }
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ip": { "id": 7, "ip": "10.0.0.5", "instance_id": null }
            })))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/servers/srv-1"))
            .and(body_partial_json(json!({ "server": { "accessIPv4": "10.0.0.5" } })))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers/srv-1/action"))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn provision_instance_boots_and_attaches() {
        let server = MockServer::start().await;
        mount_happy_compute(&server).await;

        let svc = connect(&server, false).await;
        let mut ar = AssetRequest {
            id: "a1".into(),
            host_name: "h1".into(),
            ..Default::default()
        };
        ar.model.flavor = "m1.small".into();
        ar.model.image = "img-1".into();

        let (server_id, fip) = svc.provision_instance(&mut ar).await.unwrap();
        assert_eq!(server_id, "srv-1");
        assert_eq!(fip, "10.0.0.5");
    }

    #[tokio::test]
    async fn provision_renames_to_the_resolved_ptr() {
        let server = MockServer::start().await;
        mount_happy_compute(&server).await;
        Mock::given(method("PUT"))
            .and(path("/servers/srv-1"))
            .and(body_partial_json(json!({ "server": { "name": "h1.cloud.example" } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let svc = connect(&server, false)
            .await
            .with_resolver(Box::new(FixedPtr("h1.cloud.example")));
        let mut ar = AssetRequest { host_name: "h1".into(), ..Default::default() };

        svc.provision_instance(&mut ar).await.unwrap();
    }

    #[tokio::test]
    async fn provision_adopts_a_server_address_when_no_fip_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": { "id": "srv-1", "name": "h1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {
                    "id": "srv-1", "status": "ACTIVE",
                    "addresses": { "public": [
                        { "version": 4, "addr": "192.168.0.4" },
                        { "version": 4, "addr": "172.24.4.9" }
                    ] }
                }
            })))
            .mount(&server)
            .await;
        // Pool allocation is exhausted and cleanup finds nothing.
        Mock::given(method("POST"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "floating_ips": [] })))
            .mount(&server)
            .await;

        let svc = connect(&server, false).await;
        let mut ar = AssetRequest { host_name: "h1".into(), ..Default::default() };

        // Second public address wins once no floating IP could be bound.
        let (_, fip) = svc.provision_instance(&mut ar).await.unwrap();
        assert_eq!(fip, "172.24.4.9");
    }

    #[tokio::test]
    async fn provision_fails_when_the_server_boots_into_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": { "id": "srv-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": { "id": "srv-1", "status": "ERROR", "addresses": {} }
            })))
            .mount(&server)
            .await;

        let svc = connect(&server, false).await;
        let mut ar = AssetRequest::default();

        let err = svc.provision_instance(&mut ar).await.unwrap_err();
        assert_eq!(err.code, ProvisionErrorCode::ServerCreate);
        assert_eq!(err.server_id.as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn deprovision_parks_the_fip_for_remediation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os-floating-ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floating_ips": [ { "id": 7, "ip": "10.0.0.5", "instance_id": "srv-1" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/os-floating-ips/7"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let svc = connect(&server, false).await;
        let ar = AssetRequest {
            server_id: "srv-1".into(),
            ip_address: "10.0.0.5".into(),
            remediation: true,
            ..Default::default()
        };
        svc.deprovision_instance(&ar).await.unwrap();
        assert!(svc.floating_service().find("10.0.0.5"));
    }
}
