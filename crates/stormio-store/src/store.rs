use async_trait::async_trait;
use stormio_domain::{AssetRequest, RequestStatus};

use crate::error::StoreError;

/// Typed query over the asset-request collection. The scheduler and the
/// HTTP layer only ever look records up these three ways.
#[derive(Debug, Clone)]
pub enum AssetFilter {
    ById(String),
    ByResourceId(String),
    StatusIn(Vec<RequestStatus>),
}

impl AssetFilter {
    pub fn matches(&self, ar: &AssetRequest) -> bool {
        match self {
            AssetFilter::ById(id) => ar.id == *id,
            AssetFilter::ByResourceId(rid) => ar.resource_id == *rid,
            AssetFilter::StatusIn(statuses) => statuses.contains(&ar.status),
        }
    }
}

/// One document per [`AssetRequest`], keyed by `id`.
///
/// Every call is synchronous from the caller's perspective and may fail;
/// workers persist after each mutation step so durable state never lags
/// in-memory state by more than one transition.
#[async_trait]
pub trait AssetStore: Send + Sync + 'static {
    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] when
    /// the id collides.
    async fn create(&self, ar: &AssetRequest) -> Result<(), StoreError>;

    /// Upsert on id.
    async fn update(&self, ar: &AssetRequest) -> Result<(), StoreError>;

    /// Exactly one match or [`StoreError::NotFound`].
    async fn find(&self, filter: &AssetFilter) -> Result<AssetRequest, StoreError>;

    /// All matches; `None` returns the whole collection.
    async fn find_all(&self, filter: Option<&AssetFilter>) -> Result<Vec<AssetRequest>, StoreError>;

    /// Idempotent delete; a missing id is not an error.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}
