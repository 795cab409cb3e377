use std::collections::HashMap;
use std::sync::Arc;

use stormio_domain::AssetProvider;
use stormio_overlay::OverlayClient;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ClientError;
use crate::facade::{ProvisionOptions, ServiceProvision};

/// Process-wide cache of authenticated [`ServiceProvision`] handles, keyed
/// by `username:password:endpoint`.
///
/// A miss authenticates and pings the tenant before the handle is
/// installed; a hit reuses the existing session. There is no TTL —
/// credentials rarely change, and re-authenticating per request would
/// dominate latency. A credential rotation requires a process restart.
pub struct ProviderCache {
    options: ProvisionOptions,
    overlay: OverlayClient,
    inner: Mutex<HashMap<String, Arc<ServiceProvision>>>,
}

impl ProviderCache {
    pub fn new(options: ProvisionOptions, overlay: OverlayClient) -> Self {
        Self { options, overlay, inner: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, provider: &AssetProvider) -> Result<Arc<ServiceProvision>, ClientError> {
        let key = format!(
            "{}:{}:{}",
            provider.username, provider.password, provider.endpoint_url
        );
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }

        let svc =
            ServiceProvision::connect(provider, self.options.clone(), self.overlay.clone()).await?;
        svc.ping().await?;
        let svc = Arc::new(svc);
        guard.insert(key, svc.clone());
        debug!(endpoint = %provider.endpoint_url, "asset provider installed in the cache");
        Ok(svc)
    }
}
