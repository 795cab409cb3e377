use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stormio_domain::AssetRequest;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{AssetFilter, AssetStore};

/// In-memory implementation of [`AssetStore`].
///
/// All data is lost on process exit. Suitable for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<HashMap<String, AssetRequest>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for InMemoryStore {
    async fn create(&self, ar: &AssetRequest) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&ar.id) {
            return Err(StoreError::AlreadyExists(ar.id.clone()));
        }
        guard.insert(ar.id.clone(), ar.clone());
        Ok(())
    }

    async fn update(&self, ar: &AssetRequest) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.insert(ar.id.clone(), ar.clone());
        Ok(())
    }

    async fn find(&self, filter: &AssetFilter) -> Result<AssetRequest, StoreError> {
        let guard = self.inner.read().await;
        guard
            .values()
            .find(|ar| filter.matches(ar))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_all(&self, filter: Option<&AssetFilter>) -> Result<Vec<AssetRequest>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .filter(|ar| filter.map_or(true, |f| f.matches(ar)))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormio_domain::{new_uuid, RequestStatus};

    fn dummy_request(resource: &str) -> AssetRequest {
        AssetRequest {
            id: new_uuid(),
            resource_id: resource.to_string(),
            host_name: resource.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_find_by_id() {
        let store = InMemoryStore::new();
        let ar = dummy_request("r1");
        store.create(&ar).await.unwrap();

        let got = store.find(&AssetFilter::ById(ar.id.clone())).await.unwrap();
        assert_eq!(got.resource_id, "r1");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryStore::new();
        let ar = dummy_request("r1");
        store.create(&ar).await.unwrap();
        assert!(matches!(
            store.create(&ar).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn find_missing_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.find(&AssetFilter::ById("nope".into())).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_is_upsert() {
        let store = InMemoryStore::new();
        let mut ar = dummy_request("r1");
        store.update(&ar).await.unwrap();

        ar.set_status(RequestStatus::Build);
        store.update(&ar).await.unwrap();

        let got = store.find(&AssetFilter::ById(ar.id.clone())).await.unwrap();
        assert_eq!(got.status, RequestStatus::Build);
    }

    #[tokio::test]
    async fn find_all_filters_by_status() {
        let store = InMemoryStore::new();
        let mut a = dummy_request("a");
        a.set_status(RequestStatus::Retry);
        let mut b = dummy_request("b");
        b.set_status(RequestStatus::MarkedForDeletion);
        let c = dummy_request("c");
        for ar in [&a, &b, &c] {
            store.create(ar).await.unwrap();
        }

        let rescued = store
            .find_all(Some(&AssetFilter::StatusIn(vec![
                RequestStatus::Retry,
                RequestStatus::MarkedForDeletion,
            ])))
            .await
            .unwrap();
        assert_eq!(rescued.len(), 2);

        let all = store.find_all(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = InMemoryStore::new();
        let ar = dummy_request("r1");
        store.create(&ar).await.unwrap();
        store.remove(&ar.id).await.unwrap();
        store.remove(&ar.id).await.unwrap();
        assert!(store.find(&AssetFilter::ById(ar.id)).await.is_err());
    }
}
