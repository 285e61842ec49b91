use crate::k8s_types::K8sType;
use crate::resource::{ObjectIdRef, Resource, Scope};
use crate::store::{ListParams, Patch, Store, StoreError};

use serde_json::Value;

use std::marker::PhantomData;
use std::sync::Arc;

/// Typed access to one kind in the store
pub struct Api<R: Resource> {
    store: Arc<dyn Store>,
    k8s_type: &'static K8sType,
    _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Clone for Api<R> {
    fn clone(&self) -> Self {
        Api {
            store: self.store.clone(),
            k8s_type: self.k8s_type,
            _resource: PhantomData,
        }
    }
}

impl<R: Resource> Api<R> {
    pub fn new(store: Arc<dyn Store>, scope: Scope) -> Api<R> {
        Api {
            store,
            k8s_type: R::k8s_type(scope),
            _resource: PhantomData,
        }
    }

    pub fn k8s_type(&self) -> &'static K8sType {
        self.k8s_type
    }

    pub async fn get(&self, id: &ObjectIdRef<'_>) -> Result<Option<R>, StoreError> {
        match self.store.get(self.k8s_type, id).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, params: &ListParams) -> Result<Vec<R>, StoreError> {
        let values = self.store.list(self.k8s_type, params).await?;
        values.into_iter().map(decode).collect()
    }

    pub async fn create(&self, resource: &R) -> Result<R, StoreError> {
        let value = serde_json::to_value(resource)?;
        decode(self.store.create(self.k8s_type, value).await?)
    }

    pub async fn update(&self, resource: &R) -> Result<R, StoreError> {
        let value = serde_json::to_value(resource)?;
        decode(self.store.update(self.k8s_type, value).await?)
    }

    pub async fn update_status(&self, resource: &R) -> Result<R, StoreError> {
        let value = serde_json::to_value(resource)?;
        decode(self.store.update_status(self.k8s_type, value).await?)
    }

    pub async fn patch(&self, id: &ObjectIdRef<'_>, patch: &Patch) -> Result<R, StoreError> {
        decode(self.store.patch(self.k8s_type, id, patch).await?)
    }

    /// Deleting something that is already gone is not an error
    pub async fn delete(&self, id: &ObjectIdRef<'_>) -> Result<(), StoreError> {
        log::info!("Deleting {} '{}'", self.k8s_type, id);
        match self.store.delete(self.k8s_type, id).await {
            Err(ref e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

fn decode<R: Resource>(value: Value) -> Result<R, StoreError> {
    serde_json::from_value(value).map_err(StoreError::from)
}
