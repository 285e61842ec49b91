//! The broker, instance and binding reconcilers. They share a `ControllerContext`, which holds
//! the store, the broker client factory, the event recorder and the configuration, along with
//! the lookups that more than one reconciler needs.
mod binding;
mod broker;
mod instance;
mod parameters;

pub use self::binding::BindingReconciler;
pub use self::broker::BrokerReconciler;
pub use self::instance::InstanceReconciler;
pub use self::parameters::{Parameters, REDACTED};
pub use crate::handler::{ErrorKind, ReconcileError};

use crate::config::ControllerConfig;
use crate::events::{Event, EventRecorder, EventType};
use crate::handler::Reconciler;
use crate::osb::{
    AuthConfig, BrokerClient, BrokerClientConfig, BrokerClientFactory, OriginatingIdentity,
    OsbError,
};
use crate::resource::{
    scope_of, Broker, BrokerAuthInfo, Namespace, ObjectIdRef, Resource, Scope, Secret, UserInfo,
};
use crate::store::{Api, Store};

use chrono::{DateTime, Utc};

use std::sync::Arc;

/// Stable, machine readable reasons used in conditions and events
pub mod reason {
    // brokers
    pub const ERROR_FETCHING_CATALOG: &str = "ErrorFetchingCatalog";
    pub const ERROR_SYNCING_CATALOG: &str = "ErrorSyncingCatalog";
    pub const FETCHED_CATALOG: &str = "FetchedCatalog";
    pub const ERROR_GETTING_AUTH_CREDENTIALS: &str = "ErrorGettingAuthCredentials";
    pub const ERROR_INVALID_RELIST_DURATION: &str = "ErrorInvalidRelistDuration";
    pub const ERROR_INVALID_CATALOG_RESTRICTIONS: &str = "ErrorInvalidCatalogRestrictions";
    pub const ERROR_DELETING_SERVICE_CLASS: &str = "ErrorDeletingClusterServiceClass";
    pub const ERROR_DELETING_SERVICE_PLAN: &str = "ErrorDeletingClusterServicePlan";
    pub const DELETED_BROKER_SUCCESSFULLY: &str = "DeletedClusterServiceBrokerSuccessfully";
    pub const WAITING_FOR_CATALOG_CLEANUP: &str = "WaitingForCatalogCleanup";
    pub const ERROR_RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

    // instances
    pub const PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
    pub const INSTANCE_UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";
    pub const DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
    pub const ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
    pub const ERROR_WITH_ORIGINATING_IDENTITY: &str = "ErrorWithOriginatingIdentity";
    pub const PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
    pub const ERROR_CALLING_PROVISION: &str = "ErrorCallingProvision";
    pub const UPDATE_INSTANCE_CALL_FAILED: &str = "UpdateInstanceCallFailed";
    pub const ERROR_CALLING_UPDATE_INSTANCE: &str = "ErrorCallingUpdateInstance";
    pub const DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";
    pub const DEPROVISION_BLOCKED_BY_CREDENTIALS: &str = "DeprovisionBlockedByExistingCredentials";
    pub const ERROR_POLLING_LAST_OPERATION: &str = "ErrorPollingLastOperation";
    pub const ERROR_ASYNC_OPERATION_IN_PROGRESS: &str = "ErrorAsyncOperationInProgress";
    pub const REFERENCES_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
    pub const REFERENCES_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
    pub const REFERENCES_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";
    pub const REFERENCES_DELETED_SERVICE_CLASS: &str = "ReferencesDeletedServiceClass";
    pub const REFERENCES_DELETED_SERVICE_PLAN: &str = "ReferencesDeletedServicePlan";
    pub const PROVISIONING: &str = "Provisioning";
    pub const UPDATING_INSTANCE: &str = "UpdatingInstance";
    pub const DEPROVISIONING: &str = "Deprovisioning";
    pub const PROVISION_REQUEST_IN_FLIGHT: &str = "ProvisionRequestInFlight";
    pub const UPDATE_REQUEST_IN_FLIGHT: &str = "UpdateInstanceRequestInFlight";
    pub const DEPROVISION_REQUEST_IN_FLIGHT: &str = "DeprovisionRequestInFlight";
    pub const STARTING_ORPHAN_MITIGATION: &str = "StartingInstanceOrphanMitigation";
    pub const ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
    pub const ORPHAN_MITIGATION_FAILED: &str = "OrphanMitigationFailed";
    pub const BROKER_RETURNED_FAILURE: &str = "ClusterServiceBrokerReturnedFailure";

    // bindings
    pub const REFERENCES_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
    pub const BIND_CALL_FAILED: &str = "BindCallFailed";
    pub const ERROR_CALLING_BIND: &str = "ErrorCallingBind";
    pub const ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
    pub const ERROR_EJECTING_BINDING: &str = "ErrorEjectingServiceBinding";
    pub const UNBIND_CALL_FAILED: &str = "UnbindCallFailed";
    pub const ERROR_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
    pub const ERROR_INSTANCE_REFS_UNRESOLVED: &str = "ErrorInstanceRefsUnresolved";
    pub const ERROR_PARENT_INSTANCE_NOT_READY: &str = "ErrorParentInstanceNotReady";
    pub const BINDING_NEEDS_ORPHAN_MITIGATION: &str = "ServiceBindingNeedsOrphanMitigation";
    pub const ASYNC_OPERATION_TIMEOUT: &str = "AsyncOperationTimeout";
    pub const INJECTED_BIND_RESULT: &str = "InjectedBindResult";
    pub const UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
    pub const BINDING: &str = "Binding";
    pub const UNBINDING: &str = "Unbinding";
    pub const BIND_REQUEST_IN_FLIGHT: &str = "BindingRequestInFlight";
    pub const UNBIND_REQUEST_IN_FLIGHT: &str = "UnbindingRequestInFlight";
    pub const ERROR_SECRET_CONFLICT: &str = "ErrorSecretConflict";
}

/// Everything a reconciler needs from the outside world. Cheap to clone.
#[derive(Clone)]
pub struct ControllerContext {
    pub config: Arc<ControllerConfig>,
    pub store: Arc<dyn Store>,
    pub clients: Arc<dyn BrokerClientFactory>,
    pub recorder: Arc<dyn EventRecorder>,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("config", &self.config)
            .finish()
    }
}

impl ControllerContext {
    pub fn new(
        config: Arc<ControllerConfig>,
        store: Arc<dyn Store>,
        clients: Arc<dyn BrokerClientFactory>,
        recorder: Arc<dyn EventRecorder>,
    ) -> ControllerContext {
        ControllerContext {
            config,
            store,
            clients,
            recorder,
        }
    }

    pub fn api<R: Resource>(&self, scope: Scope) -> Api<R> {
        Api::new(self.store.clone(), scope)
    }

    pub(crate) fn event<R: Resource>(
        &self,
        object: &R,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let meta = object.metadata();
        self.recorder.record(Event {
            kind: R::k8s_type(scope_of(meta)).kind,
            object: meta.id().to_owned(),
            event_type,
            reason: reason.to_owned(),
            message: message.into(),
        });
    }

    pub(crate) fn normal<R: Resource>(&self, object: &R, reason: &str, message: impl Into<String>) {
        self.event(object, EventType::Normal, reason, message);
    }

    pub(crate) fn warning<R: Resource>(&self, object: &R, reason: &str, message: impl Into<String>) {
        self.event(object, EventType::Warning, reason, message);
    }

    /// Whether an operation that started at `started` has been retried for too long
    pub(crate) fn retry_timed_out(&self, started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let limit = match chrono::Duration::from_std(self.config.reconciliation_retry_duration) {
            Ok(limit) => limit,
            Err(_) => return false,
        };
        started.map(|start| now - start > limit).unwrap_or(false)
    }

    pub(crate) async fn get_broker(
        &self,
        scope: Scope,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Broker>, ReconcileError> {
        let namespace = match scope {
            Scope::Cluster => "",
            Scope::Namespaced => namespace,
        };
        let brokers: Api<Broker> = self.api(scope);
        Ok(brokers.get(&ObjectIdRef::new(namespace, name)).await?)
    }

    /// Builds the client config for a broker, reading its auth secret if it has one. The secret
    /// of a namespaced broker defaults to the broker's own namespace.
    pub async fn broker_client_config(&self, broker: &Broker) -> Result<BrokerClientConfig, OsbError> {
        let mut config =
            BrokerClientConfig::new(broker.metadata.id().to_string(), broker.spec.url.clone());
        config.api_version = self.config.osb_api_version.clone();
        config.timeout = self.config.osb_timeout;
        config.insecure_skip_tls_verify = broker.spec.insecure_skip_tls_verify;
        if let Some(bundle) = broker.spec.ca_bundle.as_deref() {
            let pem = base64::decode(bundle).map_err(|err| {
                OsbError::AuthConfigMissing(format!("caBundle is not valid base64: {}", err))
            })?;
            config.ca_bundle = Some(pem);
        }
        if let Some(auth) = broker.spec.auth_info.as_ref() {
            config.auth = Some(self.auth_config(broker, auth).await?);
        }
        Ok(config)
    }

    async fn auth_config(&self, broker: &Broker, auth: &BrokerAuthInfo) -> Result<AuthConfig, OsbError> {
        let (secret_ref, is_basic) = match (auth.basic.as_ref(), auth.bearer.as_ref()) {
            (Some(basic), _) => (&basic.secret_ref, true),
            (None, Some(bearer)) => (&bearer.secret_ref, false),
            (None, None) => {
                return Err(OsbError::AuthConfigMissing(
                    "authInfo names neither basic nor bearer auth".to_owned(),
                ))
            }
        };
        let namespace = secret_ref
            .namespace
            .as_deref()
            .or_else(|| broker.metadata.namespace.as_deref())
            .unwrap_or_default();
        let id = ObjectIdRef::new(namespace, secret_ref.name.as_str());
        let secrets: Api<Secret> = self.api(Scope::Namespaced);
        let secret = secrets
            .get(&id)
            .await
            .map_err(|err| {
                OsbError::AuthConfigMissing(format!("failed to read auth secret {}: {}", id, err))
            })?
            .ok_or_else(|| OsbError::AuthConfigMissing(format!("auth secret {} does not exist", id)))?;

        let read = |key: &str| {
            secret.get_string(key).ok_or_else(|| {
                OsbError::AuthConfigMissing(format!("auth secret {} has no {:?} entry", id, key))
            })
        };
        if is_basic {
            Ok(AuthConfig::Basic {
                username: read("username")?,
                password: read("password")?,
            })
        } else {
            Ok(AuthConfig::Bearer {
                token: read("token")?,
            })
        }
    }

    pub async fn broker_client(&self, broker: &Broker) -> Result<Arc<dyn BrokerClient>, OsbError> {
        let config = self.broker_client_config(broker).await?;
        self.clients.client_for(&config)
    }

    pub(crate) fn originating_identity(
        &self,
        user: Option<&UserInfo>,
    ) -> Result<Option<OriginatingIdentity>, ReconcileError> {
        match user {
            None => Ok(None),
            Some(user) => OriginatingIdentity::from_user_info(user)
                .map(Some)
                .map_err(|err| {
                    ReconcileError::internal(
                        reason::ERROR_WITH_ORIGINATING_IDENTITY,
                        format!("Error building originating identity headers: {}", err),
                    )
                }),
        }
    }

    /// The uid of the namespace, or its name if the namespace object isn't visible
    pub(crate) async fn space_guid(&self, namespace: &str) -> Result<String, ReconcileError> {
        let namespaces: Api<Namespace> = self.api(Scope::Cluster);
        let found = namespaces.get(&ObjectIdRef::new("", namespace)).await?;
        Ok(found
            .map(|ns| ns.metadata.uid)
            .filter(|uid| !uid.is_empty())
            .unwrap_or_else(|| namespace.to_owned()))
    }
}

/// The reconcilers that make up the controller, in the order they should be started
pub fn standard_reconcilers(context: &ControllerContext) -> Vec<Arc<dyn Reconciler>> {
    vec![
        Arc::new(BrokerReconciler::new(context.clone())),
        Arc::new(InstanceReconciler::new(context.clone())),
        Arc::new(BindingReconciler::new(context.clone())),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::MemoryRecorder;
    use crate::osb::HttpClientFactory;
    use crate::resource::{ObjectReference, SecretAuthConfig};
    use crate::store::InMemoryStore;

    use std::time::Duration;

    fn context() -> (ControllerContext, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let config = ControllerConfig::new("test-controller")
            .reconciliation_retry_duration(Duration::from_secs(60));
        let ctx = ControllerContext::new(
            Arc::new(config),
            store.clone(),
            Arc::new(HttpClientFactory::new(None)),
            Arc::new(MemoryRecorder::new()),
        );
        (ctx, store)
    }

    fn with_basic_auth(mut broker: Broker, namespace: Option<&str>) -> Broker {
        broker.spec.auth_info = Some(BrokerAuthInfo {
            basic: Some(SecretAuthConfig {
                secret_ref: ObjectReference {
                    namespace: namespace.map(str::to_owned),
                    name: "auth".to_owned(),
                },
            }),
            bearer: None,
        });
        broker
    }

    #[tokio::test]
    async fn basic_auth_is_read_from_the_referenced_secret() {
        let (ctx, _store) = context();
        let secrets: Api<Secret> = ctx.api(Scope::Namespaced);
        secrets
            .create(
                &Secret::new("test-ns", "auth")
                    .with_entry("username", b"admin")
                    .with_entry("password", b"hunter2"),
            )
            .await
            .unwrap();

        let broker = with_basic_auth(Broker::new(None, "test-broker", "http://example.com"), Some("test-ns"));
        let config = ctx.broker_client_config(&broker).await.unwrap();
        assert_eq!("test-broker", config.name);
        assert_eq!(
            Some(AuthConfig::Basic {
                username: "admin".to_owned(),
                password: "hunter2".to_owned()
            }),
            config.auth
        );

        // namespaced brokers fall back to their own namespace
        let broker = with_basic_auth(
            Broker::new(Some("test-ns"), "test-broker", "http://example.com"),
            None,
        );
        let config = ctx.broker_client_config(&broker).await.unwrap();
        assert_eq!("test-ns/test-broker", config.name);
        assert!(config.auth.is_some());
    }

    #[tokio::test]
    async fn missing_auth_secret_is_reported() {
        let (ctx, _store) = context();
        let broker = with_basic_auth(Broker::new(None, "test-broker", "http://example.com"), Some("test-ns"));
        let err = ctx.broker_client_config(&broker).await.unwrap_err();
        assert!(matches!(err, OsbError::AuthConfigMissing(_)));
        assert!(err.to_string().contains("test-ns/auth"));
    }

    #[tokio::test]
    async fn space_guid_prefers_the_namespace_uid() {
        let (ctx, _store) = context();
        assert_eq!("test-ns", ctx.space_guid("test-ns").await.unwrap());

        let namespaces: Api<Namespace> = ctx.api(Scope::Cluster);
        let created = namespaces.create(&Namespace::new("test-ns")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.uid, ctx.space_guid("test-ns").await.unwrap());
    }

    #[test]
    fn retry_timeout_is_measured_from_the_operation_start() {
        let (ctx, _store) = context();
        let now = Utc::now();
        assert!(!ctx.retry_timed_out(None, now));
        assert!(!ctx.retry_timed_out(Some(now - chrono::Duration::seconds(30)), now));
        assert!(ctx.retry_timed_out(Some(now - chrono::Duration::seconds(61)), now));
    }
}
