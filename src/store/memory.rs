//! An in-memory `Store` with the guarantees the controllers rely on: strongly consistent reads,
//! optimistic concurrency on resource versions, a status subresource that never bumps the
//! generation, and finalizer gated deletion.
use crate::admission::{Admission, Operation, PlanLookup};
use crate::filter::Selector;
use crate::k8s_types::K8sType;
use crate::resource::{
    EntryRef, ObjectId, ObjectIdRef, ObjectMeta, Resource, Scope, ServiceClass, ServicePlan,
};
use crate::store::{ListParams, Patch, Store, StoreError, WatchEvent, WatchStream};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    objects: HashMap<&'static K8sType, BTreeMap<ObjectId, Value>>,
    last_resource_version: u64,
    watchers: Vec<(&'static K8sType, UnboundedSender<WatchEvent>)>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn get(&self, k8s_type: &'static K8sType, id: &ObjectId) -> Option<&Value> {
        self.objects.get(k8s_type).and_then(|objects| objects.get(id))
    }

    fn notify(&mut self, k8s_type: &'static K8sType, event: WatchEvent) {
        self.watchers.retain(|(watched, sender)| {
            if *watched != k8s_type {
                return true;
            }
            sender.send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, k8s_type: &'static K8sType, id: ObjectId, value: Value, added: bool) {
        self.objects
            .entry(k8s_type)
            .or_default()
            .insert(id, value.clone());
        let event = if added {
            WatchEvent::Added(value)
        } else {
            WatchEvent::Modified(value)
        };
        self.notify(k8s_type, event);
    }

    fn remove(&mut self, k8s_type: &'static K8sType, id: &ObjectId) {
        let removed = self
            .objects
            .get_mut(k8s_type)
            .and_then(|objects| objects.remove(id));
        if let Some(value) = removed {
            self.notify(k8s_type, WatchEvent::Deleted(value));
        }
    }

    fn list(&self, k8s_type: &'static K8sType, params: &ListParams) -> Vec<Value> {
        self.objects
            .get(k8s_type)
            .map(|objects| {
                objects
                    .values()
                    .filter(|obj| params.matches(obj))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    admission: Arc<Admission>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("admission", &self.admission)
            .finish()
    }
}

impl InMemoryStore {
    /// A store that runs no admission plugins
    pub fn new() -> InMemoryStore {
        InMemoryStore {
            state: Arc::new(Mutex::new(State::default())),
            admission: Arc::new(Admission::empty()),
        }
    }

    /// A store running the standard admission chain, with the default plan plugin reading
    /// the catalog out of this same store
    pub fn with_standard_admission() -> InMemoryStore {
        let state = Arc::new(Mutex::new(State::default()));
        let lookup = Arc::new(CatalogLookup {
            state: state.clone(),
        });
        InMemoryStore {
            state,
            admission: Arc::new(Admission::standard(lookup)),
        }
    }

    pub fn with_admission(admission: Admission) -> InMemoryStore {
        InMemoryStore {
            state: Arc::new(Mutex::new(State::default())),
            admission: Arc::new(admission),
        }
    }

    /// The most recently assigned resource version. Any write changes it.
    pub fn last_resource_version(&self) -> u64 {
        self.lock().last_resource_version
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Persists the result of a spec write, releasing the object if it's deleting and has no
    /// finalizers left
    fn commit_spec_write(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectId,
        mut proposed: Value,
        expected_version: Option<&str>,
    ) -> Result<Value, StoreError> {
        let mut state = self.lock();
        let current = state
            .get(k8s_type, &id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(k8s_type.storage_key(&id.as_id_ref())))?;
        let current_meta = metadata_of(&current)?;
        check_version(k8s_type, &id, &current_meta, expected_version)?;

        let mut meta = metadata_of(&proposed)?;
        meta.uid = current_meta.uid.clone();
        meta.creation_timestamp = current_meta.creation_timestamp;
        meta.deletion_timestamp = current_meta.deletion_timestamp;
        meta.generation = current_meta.generation;
        if spec_of(&proposed) != spec_of(&current) {
            meta.generation += 1;
        }
        if let Some(status) = current.get("status") {
            set_field(&mut proposed, "status", status.clone());
        } else if let Value::Object(map) = &mut proposed {
            map.remove("status");
        }

        if meta.is_deleting() && meta.finalizers.is_empty() {
            log::debug!(
                "finalizers released, removing {}",
                k8s_type.storage_key(&id.as_id_ref())
            );
            meta.resource_version = state.next_resource_version();
            set_field(&mut proposed, "metadata", serde_json::to_value(&meta)?);
            state.remove(k8s_type, &id);
            return Ok(proposed);
        }

        meta.resource_version = state.next_resource_version();
        set_field(&mut proposed, "metadata", serde_json::to_value(&meta)?);
        state.put(k8s_type, id, proposed.clone(), false);
        Ok(proposed)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

fn metadata_of(value: &Value) -> Result<ObjectMeta, StoreError> {
    let meta = value
        .get("metadata")
        .cloned()
        .ok_or_else(|| StoreError::Invalid("metadata is required".to_owned()))?;
    serde_json::from_value(meta).map_err(StoreError::from)
}

fn id_of(k8s_type: &'static K8sType, meta: &ObjectMeta) -> Result<ObjectId, StoreError> {
    if meta.name.is_empty() {
        return Err(StoreError::Invalid("metadata.name is required".to_owned()));
    }
    let namespace = meta.namespace.clone().unwrap_or_default();
    if k8s_type.namespaced == namespace.is_empty() {
        return Err(StoreError::Invalid(format!(
            "{} must {}have a namespace",
            k8s_type.kind,
            if k8s_type.namespaced { "" } else { "not " }
        )));
    }
    Ok(ObjectId::new(namespace, meta.name.clone()))
}

fn check_version(
    k8s_type: &'static K8sType,
    id: &ObjectId,
    current: &ObjectMeta,
    expected: Option<&str>,
) -> Result<(), StoreError> {
    match expected {
        Some(v) if !v.is_empty() && v != current.resource_version => Err(StoreError::Conflict(
            k8s_type.storage_key(&id.as_id_ref()),
        )),
        _ => Ok(()),
    }
}

/// Everything that isn't metadata or status
fn spec_of(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "metadata" && k.as_str() != "status")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

fn set_field(target: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = target {
        map.insert(key.to_owned(), value);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self.lock().get(k8s_type, &id.to_owned()).cloned())
    }

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        params: &ListParams,
    ) -> Result<Vec<Value>, StoreError> {
        Ok(self.lock().list(k8s_type, params))
    }

    async fn create(&self, k8s_type: &'static K8sType, object: Value) -> Result<Value, StoreError> {
        let mut object = self.admission.admit(k8s_type, Operation::Create, object, None)?;
        let mut meta = metadata_of(&object)?;
        let id = id_of(k8s_type, &meta)?;

        let mut state = self.lock();
        if state.get(k8s_type, &id).is_some() {
            return Err(StoreError::AlreadyExists(
                k8s_type.storage_key(&id.as_id_ref()),
            ));
        }
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        meta.resource_version = state.next_resource_version();
        set_field(&mut object, "metadata", serde_json::to_value(&meta)?);
        if let Value::Object(map) = &mut object {
            map.remove("status");
        }
        log::trace!("created {}", k8s_type.storage_key(&id.as_id_ref()));
        state.put(k8s_type, id, object.clone(), true);
        Ok(object)
    }

    async fn update(&self, k8s_type: &'static K8sType, object: Value) -> Result<Value, StoreError> {
        let meta = metadata_of(&object)?;
        let id = id_of(k8s_type, &meta)?;
        let current = self
            .lock()
            .get(k8s_type, &id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(k8s_type.storage_key(&id.as_id_ref())))?;
        // fail fast on stale writes before running admission
        check_version(
            k8s_type,
            &id,
            &metadata_of(&current)?,
            Some(meta.resource_version.as_str()),
        )?;
        let admitted = self
            .admission
            .admit(k8s_type, Operation::Update, object, Some(&current))?;
        self.commit_spec_write(
            k8s_type,
            id,
            admitted,
            Some(meta.resource_version.as_str()),
        )
    }

    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        object: Value,
    ) -> Result<Value, StoreError> {
        let meta = metadata_of(&object)?;
        let id = id_of(k8s_type, &meta)?;

        let mut state = self.lock();
        let mut current = state
            .get(k8s_type, &id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(k8s_type.storage_key(&id.as_id_ref())))?;
        let mut current_meta = metadata_of(&current)?;
        check_version(k8s_type, &id, &current_meta, Some(meta.resource_version.as_str()))?;

        match object.get("status") {
            Some(status) => set_field(&mut current, "status", status.clone()),
            None => {
                if let Value::Object(map) = &mut current {
                    map.remove("status");
                }
            }
        }
        current_meta.resource_version = state.next_resource_version();
        set_field(&mut current, "metadata", serde_json::to_value(&current_meta)?);
        state.put(k8s_type, id, current.clone(), false);
        Ok(current)
    }

    async fn patch(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, StoreError> {
        let id = id.to_owned();
        let current = self
            .lock()
            .get(k8s_type, &id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(k8s_type.storage_key(&id.as_id_ref())))?;
        check_version(k8s_type, &id, &metadata_of(&current)?, patch.resource_version())?;

        let mut patched = current.clone();
        patch.apply_to(&mut patched);
        let admitted = self
            .admission
            .admit(k8s_type, Operation::Update, patched, Some(&current))?;
        let expected = metadata_of(&current)?.resource_version;
        self.commit_spec_write(k8s_type, id, admitted, Some(expected.as_str()))
    }

    async fn delete(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), StoreError> {
        let id = id.to_owned();
        let mut state = self.lock();
        let mut current = state
            .get(k8s_type, &id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(k8s_type.storage_key(&id.as_id_ref())))?;
        let mut meta = metadata_of(&current)?;
        if meta.finalizers.is_empty() {
            state.remove(k8s_type, &id);
            return Ok(());
        }
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version = state.next_resource_version();
            set_field(&mut current, "metadata", serde_json::to_value(&meta)?);
            state.put(k8s_type, id, current, false);
        }
        Ok(())
    }

    fn watch(&self, k8s_type: &'static K8sType) -> WatchStream {
        let (sender, receiver) = unbounded_channel();
        self.lock().watchers.push((k8s_type, sender));
        Box::pin(UnboundedReceiverStream::new(receiver))
    }
}

/// Catalog reads for the default plan plugin, straight out of the store state
struct CatalogLookup {
    state: Arc<Mutex<State>>,
}

impl CatalogLookup {
    fn list<R: Resource>(&self, scope: Scope, namespace: &str, selector: Selector) -> Vec<R> {
        let params = ListParams::all().fields(selector);
        let params = match scope {
            Scope::Cluster => params,
            Scope::Namespaced => params.in_namespace(Some(namespace)),
        };
        let values = match self.state.lock() {
            Ok(state) => state.list(R::k8s_type(scope), &params),
            Err(poisoned) => poisoned.into_inner().list(R::k8s_type(scope), &params),
        };
        values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }
}

impl PlanLookup for CatalogLookup {
    fn find_classes(&self, scope: Scope, namespace: &str, class: &EntryRef) -> Vec<ServiceClass> {
        match Selector::parse(&class.field_selector()) {
            Ok(selector) => self.list(scope, namespace, selector),
            Err(e) => {
                log::warn!("unusable class reference {}: {}", class, e);
                Vec::new()
            }
        }
    }

    fn plans_for_class(&self, scope: Scope, namespace: &str, class_name: &str) -> Vec<ServicePlan> {
        let selector = format!("spec.serviceClassRef.name=={}", class_name);
        match Selector::parse(&selector) {
            Ok(selector) => self.list(scope, namespace, selector),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::v1beta1;
    use crate::resource::{Broker, Finalizer, ServiceInstance};
    use crate::store::Api;
    use futures::StreamExt;

    fn brokers(store: &InMemoryStore) -> Api<Broker> {
        Api::new(Arc::new(store.clone()), Scope::Cluster)
    }

    #[tokio::test]
    async fn create_assigns_identity_and_versions() {
        let store = InMemoryStore::new();
        let api = brokers(&store);
        let created = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap();
        assert_eq!(1, created.metadata.generation);
        assert!(!created.metadata.uid.is_empty());
        assert_eq!("1", created.metadata.resource_version);

        let err = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = InMemoryStore::new();
        let api = brokers(&store);
        let created = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap();
        let mut first = created.clone();
        first.spec.relist_requests = 1;
        api.update(&first).await.unwrap();

        let mut second = created;
        second.spec.relist_requests = 2;
        assert!(api.update(&second).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn only_spec_changes_bump_the_generation() {
        let store = InMemoryStore::new();
        let api = brokers(&store);
        let created = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap();

        let mut with_status = created.clone();
        with_status.status.observed_generation = 1;
        with_status.spec.url = "http://ignored.example.com".to_owned();
        let after_status = api.update_status(&with_status).await.unwrap();
        assert_eq!(1, after_status.metadata.generation);
        assert_eq!("http://example.com", after_status.spec.url);
        assert_eq!(1, after_status.status.observed_generation);

        let mut labelled = after_status.clone();
        labelled
            .metadata
            .labels
            .insert("team".to_owned(), "data".to_owned());
        let after_labels = api.update(&labelled).await.unwrap();
        assert_eq!(1, after_labels.metadata.generation);
        assert_eq!(1, after_labels.status.observed_generation);

        let mut changed = after_labels.clone();
        changed.spec.url = "http://other.example.com".to_owned();
        let after_spec = api.update(&changed).await.unwrap();
        assert_eq!(2, after_spec.metadata.generation);
    }

    #[tokio::test]
    async fn finalizers_block_deletion() {
        let store = InMemoryStore::new();
        let api = brokers(&store);
        let created = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap();
        let id = created.metadata.id().to_owned();
        let with_finalizer = api
            .patch(
                &id.as_id_ref(),
                &Patch::add_finalizer(&created.metadata, Finalizer::CatalogOwner),
            )
            .await
            .unwrap();
        assert!(with_finalizer.metadata.has_finalizer(Finalizer::CatalogOwner));

        api.delete(&id.as_id_ref()).await.unwrap();
        let deleting = api.get(&id.as_id_ref()).await.unwrap().unwrap();
        assert!(deleting.metadata.is_deleting());

        api.patch(
            &id.as_id_ref(),
            &Patch::remove_finalizer(&deleting.metadata, Finalizer::CatalogOwner),
        )
        .await
        .unwrap();
        assert!(api.get(&id.as_id_ref()).await.unwrap().is_none());
        // deleting again is fine
        api.delete(&id.as_id_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn watches_see_changes_in_order() {
        let store = InMemoryStore::new();
        let mut events = store.watch(v1beta1::ClusterServiceBroker);
        let api = brokers(&store);
        let created = api
            .create(&Broker::new(None, "test-broker", "http://example.com"))
            .await
            .unwrap();
        api.delete(&created.metadata.id()).await.unwrap();

        assert!(matches!(events.next().await, Some(WatchEvent::Added(_))));
        assert!(matches!(events.next().await, Some(WatchEvent::Deleted(_))));
    }

    #[tokio::test]
    async fn namespaces_are_enforced_by_kind() {
        let store = InMemoryStore::new();
        let instances: Api<ServiceInstance> = Api::new(Arc::new(store.clone()), Scope::Namespaced);
        let mut instance = ServiceInstance::new("test-ns", "test-instance");
        instance.metadata.namespace = None;
        assert!(matches!(
            instances.create(&instance).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn standard_admission_runs_on_create() {
        let store = InMemoryStore::with_standard_admission();
        let api = brokers(&store);
        let err = api
            .create(&Broker::new(None, "test-broker", "gopher://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }
}
