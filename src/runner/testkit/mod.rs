//! Drives the standard reconcilers against an in-memory store and a scripted broker, without
//! any informers or work queues. Tests create objects, then call `settle` to run every
//! reconciler over every object until nothing changes anymore.
mod fake_broker;

pub use self::fake_broker::FakeBrokerClient;

use crate::config::ControllerConfig;
use crate::controller::{self, ControllerContext};
use crate::events::MemoryRecorder;
use crate::handler::backoff::BackoffConfig;
use crate::handler::{ReconcileResult, Reconciler};
use crate::osb::{CatalogResponse, Plan, Service};
use crate::resource::{
    Broker, ObjectId, ObjectIdRef, Resource, Scope, ServiceBinding, ServiceInstance,
};
use crate::store::{Api, InMemoryStore, ListParams, Store};

use super::informer::object_id;

use std::sync::Arc;
use std::time::Duration;

/// Upper bound on reconcile rounds in `settle`
pub const MAX_SETTLE_ROUNDS: usize = 50;

/// `RequeueAfter` results up to this long count as pending work when settling. Longer ones,
/// like the relist timer of a broker, don't.
const FOLLOW_UP_WINDOW: Duration = Duration::from_secs(5);

pub struct TestKit {
    pub store: Arc<InMemoryStore>,
    pub broker: FakeBrokerClient,
    pub events: Arc<MemoryRecorder>,
    pub context: ControllerContext,
    pub reconcilers: Vec<Arc<dyn Reconciler>>,
}

impl std::fmt::Debug for TestKit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TestKit")
            .field("context", &self.context)
            .field("broker", &self.broker)
            .finish()
    }
}

fn needs_follow_up(result: &ReconcileResult) -> bool {
    match result {
        ReconcileResult::Done => false,
        ReconcileResult::RequeueAfter(delay) => *delay <= FOLLOW_UP_WINDOW,
        ReconcileResult::RequeueWithBackoff => true,
        ReconcileResult::Failed(err) => err.kind.is_retryable(),
    }
}

impl TestKit {
    pub fn new() -> TestKit {
        TestKit::with_config(TestKit::test_config())
    }

    /// Polls and retries happen immediately, and operations time out after a minute
    pub fn test_config() -> ControllerConfig {
        ControllerConfig::new("test-controller")
            .poll_backoff(BackoffConfig::fixed_interval(Duration::from_millis(10)))
            .retry_backoff(BackoffConfig::fixed_interval(Duration::from_millis(10)))
            .reconciliation_retry_duration(Duration::from_secs(60))
            .cluster_id("test-cluster-id")
    }

    pub fn with_config(config: ControllerConfig) -> TestKit {
        let store = Arc::new(InMemoryStore::with_standard_admission());
        let broker = FakeBrokerClient::new();
        let events = Arc::new(MemoryRecorder::new());
        let context = ControllerContext::new(
            Arc::new(config),
            store.clone(),
            Arc::new(broker.clone()),
            events.clone(),
        );
        let reconcilers = controller::standard_reconcilers(&context);
        TestKit {
            store,
            broker,
            events,
            context,
            reconcilers,
        }
    }

    /// A kit whose store already holds `test_broker` with the `test_catalog` synced
    pub async fn with_ready_broker() -> TestKit {
        let kit = TestKit::new();
        kit.broker.set_catalog(test_catalog());
        kit.create(Scope::Cluster, &test_broker()).await;
        kit.settle().await;
        kit
    }

    pub async fn create<R: Resource>(&self, scope: Scope, resource: &R) -> R {
        let api: Api<R> = self.context.api(scope);
        match api.create(resource).await {
            Ok(created) => created,
            Err(err) => panic!("failed to create {}: {}", resource.metadata().id(), err),
        }
    }

    pub async fn get<R: Resource>(&self, scope: Scope, namespace: &str, name: &str) -> Option<R> {
        let api: Api<R> = self.context.api(scope);
        let id = ObjectIdRef::new(namespace, name);
        match api.get(&id).await {
            Ok(found) => found,
            Err(err) => panic!("failed to get {}: {}", id, err),
        }
    }

    pub async fn update<R: Resource>(&self, scope: Scope, resource: &R) -> R {
        let api: Api<R> = self.context.api(scope);
        match api.update(resource).await {
            Ok(updated) => updated,
            Err(err) => panic!("failed to update {}: {}", resource.metadata().id(), err),
        }
    }

    pub async fn delete<R: Resource>(&self, scope: Scope, namespace: &str, name: &str) {
        let api: Api<R> = self.context.api(scope);
        let id = ObjectIdRef::new(namespace, name);
        if let Err(err) = api.delete(&id).await {
            panic!("failed to delete {}: {}", id, err);
        }
    }

    pub async fn list<R: Resource>(&self, scope: Scope) -> Vec<R> {
        let api: Api<R> = self.context.api(scope);
        match api.list(&ListParams::all()).await {
            Ok(list) => list,
            Err(err) => panic!("failed to list {}: {}", api.k8s_type(), err),
        }
    }

    fn reconciler(&self, name: &str) -> &Arc<dyn Reconciler> {
        match self.reconcilers.iter().find(|r| r.name() == name) {
            Some(reconciler) => reconciler,
            None => panic!("no reconciler named {:?}", name),
        }
    }

    /// Runs a single reconcile of the key by the named reconciler
    pub async fn reconcile_key(&self, reconciler: &str, key: &ObjectId) -> ReconcileResult {
        let result = self.reconciler(reconciler).reconcile(key).await;
        log::debug!("{} reconciled {} with result: {:?}", reconciler, key, result);
        result
    }

    async fn owned_keys(&self, reconciler: &dyn Reconciler) -> Vec<ObjectId> {
        let mut keys = Vec::new();
        for k8s_type in reconciler.owned_types() {
            match self.store.list(k8s_type, &ListParams::all()).await {
                Ok(objects) => keys.extend(objects.iter().filter_map(object_id)),
                Err(err) => panic!("failed to list {}: {}", k8s_type, err),
            }
        }
        keys
    }

    /// Reconciles every owned object with every reconciler, round after round, until a round
    /// writes nothing and asks for no prompt follow-up. Returns the number of rounds it took.
    pub async fn settle(&self) -> usize {
        for round in 1..=MAX_SETTLE_ROUNDS {
            let version = self.store.last_resource_version();
            let mut follow_up = false;
            for reconciler in self.reconcilers.iter() {
                for key in self.owned_keys(reconciler.as_ref()).await {
                    let result = reconciler.reconcile(&key).await;
                    log::debug!("round {}: {} reconciled {} with result: {:?}", round, reconciler.name(), key, result);
                    follow_up |= needs_follow_up(&result);
                }
            }
            if !follow_up && self.store.last_resource_version() == version {
                return round;
            }
        }
        log::warn!("Reconcilers did not settle after {} rounds", MAX_SETTLE_ROUNDS);
        MAX_SETTLE_ROUNDS
    }
}

impl Default for TestKit {
    fn default() -> TestKit {
        TestKit::new()
    }
}

/// One bindable class, `test-serviceclass`, with a single free plan, `test-plan`
pub fn test_catalog() -> CatalogResponse {
    CatalogResponse {
        services: vec![Service {
            id: "SCGUID".to_owned(),
            name: "test-serviceclass".to_owned(),
            description: "a test service".to_owned(),
            bindable: true,
            plans: vec![Plan {
                id: "PGUID".to_owned(),
                name: "test-plan".to_owned(),
                description: "a test plan".to_owned(),
                free: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub fn test_broker() -> Broker {
    Broker::new(None, "test-broker", "http://example.com")
}

pub fn test_instance() -> ServiceInstance {
    let mut instance = ServiceInstance::new("test-ns", "test-instance");
    instance.spec.plan_reference.cluster_service_class_external_name = Some("test-serviceclass".to_owned());
    instance.spec.plan_reference.cluster_service_plan_external_name = Some("test-plan".to_owned());
    instance
}

pub fn test_binding() -> ServiceBinding {
    ServiceBinding::new("test-ns", "test-binding", "test-instance")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{ServiceClass, ServicePlan};

    #[tokio::test]
    async fn ready_broker_syncs_the_test_catalog() {
        let kit = TestKit::with_ready_broker().await;
        let broker: Broker = kit.get(Scope::Cluster, "", "test-broker").await.unwrap();
        assert!(broker.status.conditions.is_true(crate::resource::ConditionType::Ready));

        let classes = kit.list::<ServiceClass>(Scope::Cluster).await;
        assert_eq!(1, classes.len());
        assert_eq!("test-serviceclass", classes[0].spec.external_name);
        let plans = kit.list::<ServicePlan>(Scope::Cluster).await;
        assert_eq!(1, plans.len());
        assert_eq!("test-plan", plans[0].spec.external_name);

        assert_eq!(1, kit.settle().await);
        assert_eq!(1, kit.broker.catalog_calls());
        assert_eq!("test-broker", kit.broker.client_configs()[0].name);
    }

    #[test]
    fn long_requeues_are_not_pending_work() {
        assert!(!needs_follow_up(&ReconcileResult::Done));
        assert!(needs_follow_up(&ReconcileResult::RequeueAfter(Duration::from_millis(10))));
        assert!(!needs_follow_up(&ReconcileResult::RequeueAfter(Duration::from_secs(900))));
        assert!(needs_follow_up(&ReconcileResult::RequeueWithBackoff));
    }
}
