use std::sync::Arc;

use stormio_provision::ProviderCache;
use stormio_scheduler::Provisioner;
use stormio_store::AssetStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AssetStore>,
    pub provisioner: Arc<Provisioner>,
    pub cache: Arc<ProviderCache>,
}
