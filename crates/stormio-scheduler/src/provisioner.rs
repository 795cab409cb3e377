use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stormio_domain::{new_uuid, AssetRequest, RequestStatus};
use stormio_overlay::OverlayClient;
use stormio_provision::{ProviderCache, ProvisionErrorCode, ServiceProvision};
use stormio_store::{AssetFilter, AssetStore};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

/// Per-channel capacity; bounds the number of requests parked between the
/// HTTP front end and the worker loops.
pub const MAX_BUFFER: usize = 50;

const CREATE_ATTEMPTS: usize = 5;
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(10);
const TERMINATE_ATTEMPTS: usize = 3;
const RESCHEDULER_INITIAL_DELAY: Duration = Duration::from_secs(2 * 60);
const RESCHEDULER_PERIOD: Duration = Duration::from_secs(5 * 60);
const AGENT_REGISTER_DELAY: Duration = Duration::from_secs(4);

/// Runtime knobs the scheduler reads from the profile.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Server creations allowed to start per minute.
    pub rate_limit: u32,
    /// Base URL of the platform that owns resource activation.
    pub vertex_url: String,
    pub usg_username: String,
    pub usg_password: String,
    pub usg_authurl: String,
}

/// The provisioning scheduler: four bounded channels feeding long-lived
/// worker loops, plus the periodic rescheduler that rescues stuck records.
///
/// Each channel receive dispatches the record to exactly one worker task;
/// the busy set keeps the rescheduler from re-enqueueing a record a worker
/// still owns.
pub struct Provisioner {
    pub c_request: mpsc::Sender<AssetRequest>,
    pub c_remediation: mpsc::Sender<AssetRequest>,
    pub c_notification: mpsc::Sender<String>,
    pub del_notification: mpsc::Sender<AssetRequest>,

    pub(crate) store: Arc<dyn AssetStore>,
    pub(crate) cache: Arc<ProviderCache>,
    pub(crate) overlay: OverlayClient,
    pub(crate) http: reqwest::Client,
    pub(crate) config: SchedulerConfig,
    busy: Mutex<HashSet<String>>,
}

struct Receivers {
    c_request: mpsc::Receiver<AssetRequest>,
    c_remediation: mpsc::Receiver<AssetRequest>,
    c_notification: mpsc::Receiver<String>,
    del_notification: mpsc::Receiver<AssetRequest>,
}

impl Provisioner {
    fn build(
        store: Arc<dyn AssetStore>,
        cache: Arc<ProviderCache>,
        overlay: OverlayClient,
        config: SchedulerConfig,
    ) -> (Arc<Self>, Receivers) {
        let (c_request, c_request_rx) = mpsc::channel(MAX_BUFFER);
        let (c_remediation, c_remediation_rx) = mpsc::channel(MAX_BUFFER);
        let (c_notification, c_notification_rx) = mpsc::channel(MAX_BUFFER);
        let (del_notification, del_notification_rx) = mpsc::channel(MAX_BUFFER);

        let prov = Arc::new(Self {
            c_request,
            c_remediation,
            c_notification,
            del_notification,
            store,
            cache,
            overlay,
            http: reqwest::Client::new(),
            config,
            busy: Mutex::new(HashSet::new()),
        });
        let receivers = Receivers {
            c_request: c_request_rx,
            c_remediation: c_remediation_rx,
            c_notification: c_notification_rx,
            del_notification: del_notification_rx,
        };
        (prov, receivers)
    }

    /// Construct the scheduler and spawn its worker loops. Must run before
    /// the HTTP front end accepts traffic.
    pub fn start(
        store: Arc<dyn AssetStore>,
        cache: Arc<ProviderCache>,
        overlay: OverlayClient,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (prov, receivers) = Self::build(store, cache, overlay, config);
        prov.clone().spawn_loops(receivers);
        prov
    }

    fn spawn_loops(self: Arc<Self>, rx: Receivers) {
        let Receivers {
            mut c_request,
            mut c_remediation,
            mut c_notification,
            mut del_notification,
        } = rx;

        // Create loop. The throttle permit is drawn after the worker task is
        // spawned, bounding creation starts globally.
        let prov = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(60) / prov.config.rate_limit.max(1);
            let mut throttle = tokio::time::interval(period);
            throttle.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while let Some(ar) = c_request.recv().await {
                debug!(areq = %ar.id, "server creation request received");
                let worker = prov.clone();
                tokio::spawn(async move {
                    let id = ar.id.clone();
                    worker.mark_busy(&id);
                    worker.handle_create(ar).await;
                    worker.clear_busy(&id);
                });
                throttle.tick().await;
            }
        });

        // Remediation loop: replace-in-place keeping the reserved address.
        let prov = self.clone();
        tokio::spawn(async move {
            while let Some(ar) = c_remediation.recv().await {
                let worker = prov.clone();
                tokio::spawn(async move {
                    let id = ar.id.clone();
                    worker.mark_busy(&id);
                    worker.handle_remediation(ar).await;
                    worker.clear_busy(&id);
                });
            }
        });

        // Activation loop.
        let prov = self.clone();
        tokio::spawn(async move {
            while let Some(resource_id) = c_notification.recv().await {
                debug!(res = %resource_id, "activation notification received");
                let worker = prov.clone();
                tokio::spawn(async move {
                    if let Err(e) = worker.notify_activation(&resource_id).await {
                        error!(res = %resource_id, error = %e, "activation failed");
                    }
                });
            }
        });

        // Deletion loop: the four teardown legs run in parallel.
        let prov = self.clone();
        tokio::spawn(async move {
            while let Some(ar) = del_notification.recv().await {
                debug!(res = %ar.resource_id, server = %ar.server_id, "delete notification received");
                let worker = prov.clone();
                tokio::spawn(async move {
                    let id = ar.id.clone();
                    worker.mark_busy(&id);
                    worker.handle_deletion(ar).await;
                    worker.clear_busy(&id);
                });
            }
        });

        // Rescheduler.
        let prov = self;
        tokio::spawn(async move {
            tokio::time::sleep(RESCHEDULER_INITIAL_DELAY).await;
            loop {
                if let Err(e) = prov.rescue_pass().await {
                    error!(error = %e, "rescheduler pass failed");
                }
                tokio::time::sleep(RESCHEDULER_PERIOD).await;
            }
        });
    }

    // ── Busy set ──────────────────────────────────────────────────────────────

    fn mark_busy(&self, id: &str) {
        self.busy.lock().unwrap().insert(id.to_string());
    }

    fn clear_busy(&self, id: &str) {
        self.busy.lock().unwrap().remove(id);
    }

    fn is_busy(&self, id: &str) -> bool {
        self.busy.lock().unwrap().contains(id)
    }

    // ── Create ────────────────────────────────────────────────────────────────

    async fn handle_create(&self, mut ar: AssetRequest) {
        if ar.provider.is_empty() {
            // Agent-only request: no IaaS work, just register the overlay
            // agent under a fresh serial key once the caller side settles.
            ar.serial_key = new_uuid();
            tokio::time::sleep(AGENT_REGISTER_DELAY).await;
            let serial = ar.serial_key.clone();
            if let Err(e) = self.overlay.register_storm_agent(&mut ar, &serial).await {
                error!(areq = %ar.id, error = %e, "failed to register the agent");
                ar.set_status(RequestStatus::Retry);
                if let Err(e) = self.store.update(&ar).await {
                    error!(areq = %ar.id, error = %e, "failed to persist retry status");
                }
                return;
            }
            self.update_and_notify(&mut ar).await;
            return;
        }

        if self.create_server(&mut ar).await.is_ok() {
            if ar.ip_address.is_empty() {
                debug!(areq = %ar.id, "floating ip is not allocated, not notifying the caller");
                return;
            }
            debug!(areq = %ar.id, server = %ar.server_id, "notifying the caller about the new asset");
            self.update_and_notify(&mut ar).await;
        }
    }

    /// Build the server with up to five attempts, deprovisioning half-built
    /// instances between tries. Ends in `SERVER_CREATED` or `RETRY`.
    pub(crate) async fn create_server(&self, ar: &mut AssetRequest) -> Result<(), SchedulerError> {
        debug!(areq = %ar.id, "creating a server");
        let svc = self.cache.get(&ar.provider).await.map_err(|e| {
            error!(areq = %ar.id, res = %ar.resource_id, error = %e, "no service provision instance, can't create");
            SchedulerError::InvalidProvider
        })?;

        ar.set_status(RequestStatus::Build);
        self.persist(ar).await;

        let mut created = false;
        for attempt in 1..=CREATE_ATTEMPTS {
            match svc.provision_instance(ar).await {
                Ok((server_id, fip)) => {
                    ar.server_id = server_id;
                    ar.ip_address = fip;
                    created = true;
                    break;
                }
                Err(perr) => {
                    if let Some(server_id) = &perr.server_id {
                        ar.server_id = server_id.clone();
                    }
                    match perr.code {
                        ProvisionErrorCode::ServerCreate
                        | ProvisionErrorCode::SettingHostName
                        | ProvisionErrorCode::AssociateIp
                        | ProvisionErrorCode::StormRegister => {
                            if !ar.server_id.is_empty() {
                                let _ = svc.deprovision_instance(ar).await;
                            }
                        }
                        ProvisionErrorCode::FindFlavor | ProvisionErrorCode::FindImage => {
                            debug!(areq = %ar.id, error = %perr, "image or flavor not found");
                        }
                        ProvisionErrorCode::ServerDetail => {}
                    }
                    debug!(areq = %ar.id, attempt, error = %perr, "provisioning failed, retrying in 10 seconds");
                }
            }
            tokio::time::sleep(CREATE_RETRY_DELAY).await;
        }

        if created {
            ar.set_status(RequestStatus::ServerCreated);
        } else {
            debug!(areq = %ar.id, "rescheduling the asset create request");
            ar.log("error", format!("provisioning failed after {CREATE_ATTEMPTS} attempts"));
            ar.set_status(RequestStatus::Retry);
        }
        self.persist(ar).await;
        if created {
            Ok(())
        } else {
            Err(SchedulerError::RetriesExhausted)
        }
    }

    // ── Remediation ───────────────────────────────────────────────────────────

    async fn handle_remediation(&self, mut ar: AssetRequest) {
        if self.terminate_failed_resource(&ar, true).await.is_err() {
            return;
        }
        if self.create_server(&mut ar).await.is_ok() {
            debug!(areq = %ar.id, res = %ar.resource_id, server = %ar.server_id, "notifying the caller after remediation");
            self.update_and_notify(&mut ar).await;
        }
    }

    // ── Deletion ──────────────────────────────────────────────────────────────

    async fn handle_deletion(&self, ar: AssetRequest) {
        let overlay = self.overlay.clone();
        let domain_leg = {
            let ar = ar.clone();
            let overlay = overlay.clone();
            tokio::spawn(async move {
                let _ = overlay.domain_delete_agent(&ar).await;
            })
        };
        let tracker_leg = {
            let ar = ar.clone();
            tokio::spawn(async move {
                let _ = overlay.de_register_storm_agent(&ar).await;
            })
        };

        let deactivate = self.notify_deactivation(&ar);
        let detach = self.notify_detach_asset(&ar);
        let (deactivated, detached) = tokio::join!(deactivate, detach);
        if let Err(e) = deactivated {
            error!(areq = %ar.id, res = %ar.resource_id, error = %e, "deactivation failed");
        }
        if let Err(e) = detached {
            error!(areq = %ar.id, res = %ar.resource_id, error = %e, "caller detach failed");
        }
        let _ = tokio::join!(domain_leg, tracker_leg);
    }

    /// Terminate the IaaS instance and drop the durable record. Agent-only
    /// records have no instance; their document is removed directly.
    pub(crate) async fn notify_deactivation(&self, ar: &AssetRequest) -> Result<(), SchedulerError> {
        if !ar.provider.is_empty() {
            self.terminate_instance(ar).await?;
        }
        self.store.remove(&ar.id).await?;
        Ok(())
    }

    /// Caller-detach plus instance teardown for a record being recycled.
    /// `_keep_key` is kept for call-site symmetry with deletion; key cleanup
    /// happens on the control plane since the agent release moved there.
    pub(crate) async fn terminate_failed_resource(
        &self,
        ar: &AssetRequest,
        _keep_key: bool,
    ) -> Result<(), SchedulerError> {
        let _ = self.notify_detach_asset(ar).await;
        if ar.provider.is_empty() {
            return Ok(());
        }
        self.terminate_instance(ar).await
    }

    async fn terminate_instance(&self, ar: &AssetRequest) -> Result<(), SchedulerError> {
        let svc: Arc<ServiceProvision> = self.cache.get(&ar.provider).await.map_err(|e| {
            error!(areq = %ar.id, res = %ar.resource_id, error = %e, "no service provision instance, can't delete");
            SchedulerError::InvalidProvider
        })?;

        debug!(areq = %ar.id, res = %ar.resource_id, "verifying connectivity to the resource");
        // Once the delete call reaches the IaaS the instance will go away;
        // a server that is already gone needs no call at all.
        if svc.get_server(&ar.host_name, &ar.server_id).await.is_ok() {
            for _ in 0..TERMINATE_ATTEMPTS {
                debug!(areq = %ar.id, server = %ar.server_id, "about to deprovision the instance");
                match svc.deprovision_instance(ar).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(areq = %ar.id, server = %ar.server_id, error = %e, "failed to delete the server");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    }

    // ── Rescheduler ───────────────────────────────────────────────────────────

    /// One reconciler sweep: rescue `RETRY` records back onto the create
    /// channel and finish the teardown of `MARKED_FOR_DELETION` ones.
    /// Records a worker currently owns are skipped.
    pub(crate) async fn rescue_pass(&self) -> Result<(), SchedulerError> {
        let stuck = self
            .store
            .find_all(Some(&AssetFilter::StatusIn(vec![
                RequestStatus::Retry,
                RequestStatus::MarkedForDeletion,
            ])))
            .await?;
        debug!(count = stuck.len(), "asset requests waiting for a retry");

        for ar in stuck {
            if self.is_busy(&ar.id) {
                debug!(areq = %ar.id, "record is owned by a worker, skipping");
                continue;
            }
            match ar.status {
                RequestStatus::MarkedForDeletion => {
                    debug!(areq = %ar.id, res = %ar.resource_id, host = %ar.host_name, "marked for deletion, terminating the asset");
                    if let Err(e) = self.notify_deactivation(&ar).await {
                        error!(areq = %ar.id, error = %e, "deactivation failed during rescue");
                    }
                }
                RequestStatus::Retry => {
                    debug!(areq = %ar.id, res = %ar.resource_id, host = %ar.host_name, "recreating the asset");
                    let _ = self.terminate_failed_resource(&ar, false).await;
                    if let Err(e) = self.c_request.send(ar).await {
                        warn!(error = %e, "create channel closed, stopping rescue");
                        break;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    pub(crate) async fn persist(&self, ar: &AssetRequest) {
        if let Err(e) = self.store.update(ar).await {
            error!(areq = %ar.id, error = %e, "failed to persist the request");
        }
    }

    /// How many more floating IPs the request's tenant may attach.
    pub async fn check_fip_availability(&self, ar: &AssetRequest) -> Result<i64, SchedulerError> {
        match self.cache.get(&ar.provider).await {
            Ok(svc) => {
                info!(areq = %ar.id, "checking floating ip availability");
                svc.check_availability()
                    .await
                    .map_err(|e| SchedulerError::Notification(e.to_string()))
            }
            Err(_) => Err(SchedulerError::InvalidProvider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormio_provision::ProvisionOptions;
    use stormio_store::InMemoryStore;

    pub(crate) fn test_config() -> SchedulerConfig {
        SchedulerConfig { rate_limit: 60, ..Default::default() }
    }

    pub(crate) fn test_provisioner(store: Arc<dyn AssetStore>) -> Arc<Provisioner> {
        let cache = Arc::new(ProviderCache::new(
            ProvisionOptions::default(),
            OverlayClient::new(),
        ));
        let (prov, _receivers) = Provisioner::build(store, cache, OverlayClient::new(), test_config());
        prov
    }

    fn retry_record(id: &str) -> AssetRequest {
        let mut ar = AssetRequest {
            id: id.to_string(),
            resource_id: format!("res-{id}"),
            ..Default::default()
        };
        ar.set_status(RequestStatus::Retry);
        ar
    }

    #[tokio::test]
    async fn rescue_re_enqueues_retry_records() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ProviderCache::new(
            ProvisionOptions::default(),
            OverlayClient::new(),
        ));
        let (prov, mut receivers) =
            Provisioner::build(store.clone(), cache, OverlayClient::new(), test_config());

        store.create(&retry_record("a1")).await.unwrap();
        prov.rescue_pass().await.unwrap();

        let rescued = receivers.c_request.try_recv().unwrap();
        assert_eq!(rescued.id, "a1");
    }

    #[tokio::test]
    async fn rescue_skips_records_owned_by_a_worker() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ProviderCache::new(
            ProvisionOptions::default(),
            OverlayClient::new(),
        ));
        let (prov, mut receivers) =
            Provisioner::build(store.clone(), cache, OverlayClient::new(), test_config());

        store.create(&retry_record("busy-1")).await.unwrap();
        prov.mark_busy("busy-1");
        prov.rescue_pass().await.unwrap();

        assert!(receivers.c_request.try_recv().is_err());
    }

    #[tokio::test]
    async fn rescue_removes_agent_only_records_marked_for_deletion() {
        let store = Arc::new(InMemoryStore::new());
        let prov = test_provisioner(store.clone());

        let mut ar = retry_record("d1");
        ar.set_status(RequestStatus::MarkedForDeletion);
        store.create(&ar).await.unwrap();

        prov.rescue_pass().await.unwrap();
        assert!(store
            .find(&AssetFilter::ById("d1".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn busy_set_round_trips() {
        let prov = test_provisioner(Arc::new(InMemoryStore::new()));
        assert!(!prov.is_busy("x"));
        prov.mark_busy("x");
        assert!(prov.is_busy("x"));
        prov.clear_busy("x");
        assert!(!prov.is_busy("x"));
    }
}
