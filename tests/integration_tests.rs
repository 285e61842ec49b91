use osb_controller::controller::{self, reason, ControllerContext};
use osb_controller::events::MemoryRecorder;
use osb_controller::osb::{
    AuthConfig, BindRequest, BrokerClient, BrokerClientConfig, DeprovisionRequest,
    HttpBrokerClient, LastOperationRequest, LastOperationResponse, LastOperationState, OsbError,
    ProvisionRequest, ProvisionResponse, RequestContext,
};
use osb_controller::prelude::*;
use osb_controller::resource::{ConditionType, Finalizer, RelistBehavior};
use osb_controller::runner::metrics::Metrics;
use osb_controller::runner::testkit::{
    test_binding, test_broker, test_catalog, FakeBrokerClient, TestKit,
};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use serde_json::json;
use tokio::runtime::Handle;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_logging() {
    std::env::set_var("RUST_LOG", "osb_controller=debug");
    let _ = env_logger::try_init();
}

fn instance_key() -> ObjectId {
    ObjectId::new("test-ns", "test-instance")
}

async fn get_instance(kit: &TestKit) -> ServiceInstance {
    kit.get(Scope::Namespaced, "test-ns", "test-instance")
        .await
        .expect("instance should exist")
}

fn instance_for_plan(plan_external_name: &str) -> ServiceInstance {
    let mut instance = ServiceInstance::new("test-ns", "test-instance");
    instance.spec.plan_reference.cluster_service_class_external_name = Some("test-serviceclass".to_owned());
    instance.spec.plan_reference.cluster_service_plan_external_name = Some(plan_external_name.to_owned());
    instance
}

#[tokio::test]
async fn happy_path_provisions_once_and_stays_quiet() {
    init_logging();
    let kit = TestKit::with_ready_broker().await;

    let broker: Broker = kit.get(Scope::Cluster, "", "test-broker").await.unwrap();
    assert!(broker.status.conditions.is_true(ConditionType::Ready));
    assert_eq!(1, kit.list::<ServiceClass>(Scope::Cluster).await.len());
    assert_eq!(1, kit.list::<ServicePlan>(Scope::Cluster).await.len());

    kit.create(Scope::Namespaced, &instance_for_plan("test-plan")).await;
    kit.settle().await;

    let instance = get_instance(&kit).await;
    assert!(instance.is_ready());
    let checksum = instance.status.checksum.clone().expect("checksum should be set");
    let provisions = kit.broker.provision_calls();
    assert_eq!(1, provisions.len());
    assert_eq!("SCGUID", provisions[0].service_id);
    assert_eq!("PGUID", provisions[0].plan_id);

    let result = kit.reconcile_key("service-instance", &instance_key()).await;
    assert_eq!(ReconcileResult::Done, result);
    assert_eq!(1, kit.broker.provision_calls().len());
    assert_eq!(Some(checksum), get_instance(&kit).await.status.checksum);
}

#[tokio::test]
async fn missing_plan_is_a_terminal_user_error() {
    init_logging();
    let kit = TestKit::with_ready_broker().await;
    kit.create(Scope::Namespaced, &instance_for_plan("no-such-plan")).await;
    kit.settle().await;

    let instance = get_instance(&kit).await;
    assert!(instance.is_failed());
    assert_eq!(
        Some(reason::REFERENCES_NONEXISTENT_SERVICE_PLAN),
        instance.status.conditions.reason(ConditionType::Failed)
    );
    assert!(kit.broker.provision_calls().is_empty());
}

#[tokio::test]
async fn async_provision_succeeds_on_the_third_poll() {
    init_logging();
    let kit = TestKit::with_ready_broker().await;
    kit.broker.on_provision(Ok(ProvisionResponse {
        is_async: true,
        dashboard_url: None,
        operation_key: Some("op-1".to_owned()),
    }));
    for state in vec![
        LastOperationState::InProgress,
        LastOperationState::InProgress,
        LastOperationState::Succeeded,
    ] {
        kit.broker.on_poll(Ok(LastOperationResponse::new(state)));
    }
    kit.create(Scope::Namespaced, &instance_for_plan("test-plan")).await;

    kit.reconcile_key("service-instance", &instance_key()).await;
    assert!(get_instance(&kit).await.status.async_op_in_progress);

    kit.settle().await;
    assert_eq!(3, kit.broker.poll_calls().len());
    let instance = get_instance(&kit).await;
    assert!(instance.is_ready());
    assert!(!instance.status.async_op_in_progress);
    assert!(instance.status.checksum.is_some());
}

#[tokio::test]
async fn binding_waits_for_the_instance_operation_to_finish() {
    init_logging();
    let kit = TestKit::with_ready_broker().await;
    kit.broker.on_provision(Ok(ProvisionResponse {
        is_async: true,
        dashboard_url: None,
        operation_key: Some("op-1".to_owned()),
    }));
    kit.create(Scope::Namespaced, &instance_for_plan("test-plan")).await;
    kit.reconcile_key("service-instance", &instance_key()).await;
    kit.create(Scope::Namespaced, &test_binding()).await;

    let binding_key = ObjectId::new("test-ns", "test-binding");
    kit.reconcile_key("service-binding", &binding_key).await;
    let binding: ServiceBinding = kit.get(Scope::Namespaced, "test-ns", "test-binding").await.unwrap();
    assert!(!binding.is_ready());
    assert_eq!(
        Some(reason::ERROR_ASYNC_OPERATION_IN_PROGRESS),
        binding.status.conditions.reason(ConditionType::Ready)
    );
    assert!(kit.broker.bind_calls().is_empty());

    kit.settle().await;
    let binding: ServiceBinding = kit.get(Scope::Namespaced, "test-ns", "test-binding").await.unwrap();
    assert!(binding.is_ready());
    assert_eq!(1, kit.broker.bind_calls().len());
    let secret: Option<Secret> = kit.get(Scope::Namespaced, "test-ns", "test-binding").await;
    assert!(secret.is_some());
}

#[tokio::test]
async fn manual_broker_fetches_only_when_relist_requests_increase() {
    init_logging();
    let kit = TestKit::new();
    kit.broker.set_catalog(test_catalog());
    let mut broker = test_broker();
    broker.spec.relist_behavior = RelistBehavior::Manual;
    broker.spec.relist_requests = 1;
    kit.create(Scope::Cluster, &broker).await;
    kit.settle().await;
    assert_eq!(1, kit.broker.catalog_calls());

    let mut broker: Broker = kit.get(Scope::Cluster, "", "test-broker").await.unwrap();
    broker.spec.relist_requests = 2;
    kit.update(Scope::Cluster, &broker).await;
    kit.settle().await;
    assert_eq!(2, kit.broker.catalog_calls());

    let brokers: Api<Broker> = kit.context.api(Scope::Cluster);
    let mut decremented: Broker = kit.get(Scope::Cluster, "", "test-broker").await.unwrap();
    decremented.spec.relist_requests = 1;
    assert!(brokers.update(&decremented).await.is_err());

    let unchanged: Broker = kit.get(Scope::Cluster, "", "test-broker").await.unwrap();
    kit.update(Scope::Cluster, &unchanged).await;
    kit.settle().await;
    assert_eq!(2, kit.broker.catalog_calls());
}

#[tokio::test]
async fn deleted_broker_waits_for_instances_using_its_catalog() {
    init_logging();
    let kit = TestKit::with_ready_broker().await;
    kit.create(Scope::Namespaced, &instance_for_plan("test-plan")).await;
    kit.settle().await;
    assert!(get_instance(&kit).await.is_ready());

    kit.delete::<Broker>(Scope::Cluster, "", "test-broker").await;
    kit.settle().await;

    let broker: Broker = kit
        .get(Scope::Cluster, "", "test-broker")
        .await
        .expect("broker should still exist");
    assert!(broker.metadata.is_deleting());
    assert!(broker.metadata.has_finalizer(Finalizer::CatalogOwner));
    let classes = kit.list::<ServiceClass>(Scope::Cluster).await;
    assert_eq!(1, classes.len());
    assert!(classes[0].status.removed_from_broker_catalog);

    kit.delete::<ServiceInstance>(Scope::Namespaced, "test-ns", "test-instance").await;
    kit.settle().await;

    assert_eq!(1, kit.broker.deprovision_calls().len());
    assert!(kit.list::<ServiceInstance>(Scope::Namespaced).await.is_empty());
    assert!(kit.list::<ServiceClass>(Scope::Cluster).await.is_empty());
    assert!(kit.list::<ServicePlan>(Scope::Cluster).await.is_empty());
    assert!(kit.get::<Broker>(Scope::Cluster, "", "test-broker").await.is_none());
}

async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_controllers_provision_from_watch_events() {
    init_logging();
    let store = Arc::new(InMemoryStore::with_standard_admission());
    let broker = FakeBrokerClient::new();
    broker.set_catalog(test_catalog());
    let config = TestKit::test_config()
        .worker_count(1)
        .expose_metrics(false)
        .expose_health(false);
    let context = ControllerContext::new(
        Arc::new(config.clone()),
        store.clone(),
        Arc::new(broker.clone()),
        Arc::new(MemoryRecorder::new()),
    );
    let reconcilers = controller::standard_reconcilers(&context);
    let metrics = Metrics::new().expect("failed to create metrics");
    let handle = start_controllers(&Handle::current(), &config, store.clone(), reconcilers, metrics);

    let brokers: Api<Broker> = Api::new(store.clone(), Scope::Cluster);
    let plans: Api<ServicePlan> = Api::new(store.clone(), Scope::Cluster);
    let instances: Api<ServiceInstance> = Api::new(store.clone(), Scope::Namespaced);
    brokers.create(&test_broker()).await.expect("failed to create broker");
    let plans = &plans;
    eventually("the catalog to sync", Duration::from_secs(10), move || async move {
        plans.list(&ListParams::all()).await.map(|p| p.len() == 1).unwrap_or(false)
    })
    .await;

    instances
        .create(&instance_for_plan("test-plan"))
        .await
        .expect("failed to create instance");
    let instances = &instances;
    let id = ObjectIdRef::new("test-ns", "test-instance");
    eventually("the instance to become ready", Duration::from_secs(10), move || async move {
        match instances.get(&id).await {
            Ok(Some(instance)) => instance.is_ready(),
            _ => false,
        }
    })
    .await;
    assert_eq!(1, broker.provision_calls().len());
    assert!(handle.is_active());
    handle.shutdown_now();
}

/// A broker that answers a handful of fixed routes, and records the method, path and query of
/// every request it gets
async fn start_fake_broker(requests: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let service = make_service_fn(move |_| {
        let requests = requests.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let requests = requests.clone();
                async move {
                    let line = format!(
                        "{} {}{}",
                        req.method(),
                        req.uri().path(),
                        req.uri().query().map(|q| format!("?{}", q)).unwrap_or_default()
                    );
                    requests.lock().unwrap().push(line);
                    let authorized = req.headers().get("authorization").and_then(|h| h.to_str().ok())
                        == Some("Basic dXNlcjpwYXNz");
                    let versioned = req.headers().contains_key("x-broker-api-version");
                    let (status, body) = if !authorized || !versioned {
                        (401, json!({}))
                    } else {
                        match (req.method(), req.uri().path()) {
                            (&Method::GET, "/v2/catalog") => (
                                200,
                                json!({"services": [{
                                    "id": "SCGUID",
                                    "name": "test-serviceclass",
                                    "bindable": true,
                                    "plans": [{"id": "PGUID", "name": "test-plan", "free": true}],
                                }]}),
                            ),
                            (&Method::PUT, "/v2/service_instances/inst-1") => {
                                (202, json!({"operation": "op-1"}))
                            }
                            (&Method::GET, "/v2/service_instances/inst-1/last_operation") => {
                                (200, json!({"state": "in progress", "description": "halfway"}))
                            }
                            (&Method::DELETE, "/v2/service_instances/gone") => (410, json!({})),
                            (&Method::PUT, "/v2/service_instances/inst-1/service_bindings/bind-1") => {
                                (201, json!({"credentials": {"password": "hunter2"}}))
                            }
                            _ => (
                                400,
                                json!({"error": "BadRequest", "description": "unknown route"}),
                            ),
                        }
                    };
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                }
            }))
        }
    });
    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(service);
    let address = server.local_addr();
    tokio::spawn(async move {
        if let Err(err) = server.await {
            log::error!("fake broker failed: {}", err);
        }
    });
    address
}

#[tokio::test]
async fn http_client_speaks_the_osb_wire_protocol() {
    init_logging();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let address = start_fake_broker(requests.clone()).await;
    let mut config = BrokerClientConfig::new("test-broker", format!("http://{}", address));
    config.auth = Some(AuthConfig::Basic {
        username: "user".to_owned(),
        password: "pass".to_owned(),
    });
    config.timeout = Duration::from_secs(5);
    let client = HttpBrokerClient::new(config, None).expect("failed to create client");

    let catalog = client.get_catalog().await.expect("catalog should be fetched");
    assert_eq!(test_catalog().services[0].plans[0].id, catalog.services[0].plans[0].id);
    assert_eq!(Some(true), catalog.services[0].plans[0].free);

    let provision = ProvisionRequest {
        instance_id: "inst-1".to_owned(),
        accepts_incomplete: true,
        service_id: "SCGUID".to_owned(),
        plan_id: "PGUID".to_owned(),
        organization_guid: "test-cluster-id".to_owned(),
        space_guid: "test-ns".to_owned(),
        parameters: None,
        context: RequestContext::kubernetes("test-ns", "test-cluster-id"),
        originating_identity: None,
    };
    let response = client.provision_instance(&provision).await.unwrap();
    assert!(response.is_async);
    assert_eq!(Some("op-1".to_owned()), response.operation_key);

    let poll = LastOperationRequest {
        instance_id: "inst-1".to_owned(),
        service_id: Some("SCGUID".to_owned()),
        plan_id: None,
        operation_key: Some("op-1".to_owned()),
        originating_identity: None,
    };
    let state = client.poll_last_operation(&poll).await.unwrap();
    assert_eq!(LastOperationState::InProgress, state.state);
    assert_eq!(Some("halfway".to_owned()), state.description);

    let deprovision = DeprovisionRequest {
        instance_id: "gone".to_owned(),
        accepts_incomplete: true,
        service_id: "SCGUID".to_owned(),
        plan_id: "PGUID".to_owned(),
        originating_identity: None,
    };
    let response = client.deprovision_instance(&deprovision).await.unwrap();
    assert!(!response.is_async);

    let bind = BindRequest {
        binding_id: "bind-1".to_owned(),
        instance_id: "inst-1".to_owned(),
        accepts_incomplete: false,
        service_id: "SCGUID".to_owned(),
        plan_id: "PGUID".to_owned(),
        parameters: None,
        bind_resource: None,
        context: RequestContext::kubernetes("test-ns", "test-cluster-id"),
        originating_identity: None,
    };
    let response = client.bind(&bind).await.unwrap();
    assert_eq!(Some(&json!("hunter2")), response.credentials.as_ref().and_then(|c| c.get("password")));

    let mut unknown = provision.clone();
    unknown.instance_id = "nope".to_owned();
    match client.provision_instance(&unknown).await {
        Err(err @ OsbError::HttpStatus { .. }) => {
            assert_eq!(Some(400), err.status());
            assert_eq!(Some("BadRequest"), err.error_code());
            assert!(!err.is_retryable());
        }
        other => panic!("expected a 400, got {:?}", other),
    }

    let requests = requests.lock().unwrap().clone();
    assert_eq!("GET /v2/catalog", requests[0]);
    assert_eq!("PUT /v2/service_instances/inst-1?accepts_incomplete=true", requests[1]);
    assert_eq!(
        "GET /v2/service_instances/inst-1/last_operation?service_id=SCGUID&operation=op-1",
        requests[2]
    );
    assert_eq!(
        "DELETE /v2/service_instances/gone?accepts_incomplete=true&service_id=SCGUID&plan_id=PGUID",
        requests[3]
    );
}
