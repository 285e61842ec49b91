use crate::checksum::{binding_spec_checksum, CHECKSUM_VERSION};
use crate::controller::parameters::build_parameters;
use crate::controller::{reason, ControllerContext};
use crate::handler::backoff::KeyedBackoff;
use crate::handler::{ErrorKind, ReconcileError, ReconcileResult, Reconciler};
use crate::k8s_types::{v1beta1, K8sType};
use crate::osb::{
    BindRequest, BindingLastOperationRequest, GetBindingRequest, LastOperationState,
    RequestContext, UnbindRequest,
};
use crate::resource::{
    BindingOperation, BindingProperties, BindingStatus, Broker, ConditionStatus, ConditionType,
    Finalizer, InstanceProperties, JsonObject, ObjectId, ObjectIdRef, ObjectReference, Resource,
    Scope, Secret,
    SecretTransform, ServiceBinding, ServiceClass, ServiceInstance, ServicePlan, UnbindStatus,
};
use crate::store::{Api, ListParams, Patch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Binds to provisioned instances and projects the returned credentials into a secret
pub struct BindingReconciler {
    ctx: ControllerContext,
    polls: KeyedBackoff<ObjectId>,
}

fn namespace_of(binding: &ServiceBinding) -> String {
    binding.metadata.namespace.clone().unwrap_or_default()
}

fn mark_failed(status: &mut BindingStatus, failure_reason: &'static str, message: &str, now: DateTime<Utc>) {
    status
        .conditions
        .set(ConditionType::Ready, ConditionStatus::False, failure_reason, message, now);
    status
        .conditions
        .set(ConditionType::Failed, ConditionStatus::True, failure_reason, message, now);
    status.current_operation = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.operation_start_time = None;
    status.reconciled_generation = status.observed_generation;
}

/// Decoded entries of the secrets named by `addKeysFrom` transforms
pub(crate) type AddedKeys = HashMap<ObjectId, BTreeMap<String, Vec<u8>>>;

/// The secret an `addKeysFrom` transform copies from
fn added_keys_source(namespace: &str, secret_ref: &ObjectReference) -> ObjectId {
    ObjectId::new(
        secret_ref.namespace.as_deref().unwrap_or(namespace),
        secret_ref.name.as_str(),
    )
}

/// Flattens broker credentials into secret entries. Strings are stored as they are, anything
/// else as its JSON encoding. The binding's transforms are applied in order.
pub(crate) fn credential_entries(
    credentials: &JsonObject,
    transforms: &[SecretTransform],
    namespace: &str,
    added: &AddedKeys,
) -> BTreeMap<String, Vec<u8>> {
    let mut entries: BTreeMap<String, Vec<u8>> = credentials
        .iter()
        .map(|(key, value)| {
            let bytes = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                other => other.to_string().into_bytes(),
            };
            (key.clone(), bytes)
        })
        .collect();

    for transform in transforms {
        match transform {
            SecretTransform::RenameKey { from, to } => {
                if let Some(value) = entries.remove(from) {
                    entries.insert(to.clone(), value);
                }
            }
            SecretTransform::AddKey { key, value } => {
                entries.insert(key.clone(), value.as_bytes().to_vec());
            }
            SecretTransform::AddKeysFrom { secret_ref } => {
                if let Some(source) = added.get(&added_keys_source(namespace, secret_ref)) {
                    entries.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            SecretTransform::RemoveKey { key } => {
                entries.remove(key);
            }
        }
    }
    entries
}

/// What a bind or unbind needs to know about the parent instance
struct Parent {
    instance: ServiceInstance,
    props: InstanceProperties,
    broker: Broker,
}

impl BindingReconciler {
    pub fn new(ctx: ControllerContext) -> BindingReconciler {
        let polls = KeyedBackoff::new(ctx.config.poll_backoff.clone());
        BindingReconciler { ctx, polls }
    }

    fn bindings(&self) -> Api<ServiceBinding> {
        self.ctx.api(Scope::Namespaced)
    }

    fn next_poll(&self, key: &ObjectId) -> Duration {
        self.polls
            .next_backoff(key)
            .unwrap_or(self.polls.config().max_interval)
    }

    async fn reconcile_binding(&self, key: &ObjectId) -> Result<ReconcileResult, ReconcileError> {
        let binding = match self.bindings().get(&key.as_id_ref()).await? {
            Some(binding) => binding,
            None => {
                self.polls.reset(key);
                return Ok(ReconcileResult::Done);
            }
        };

        if binding.status.async_op_in_progress {
            return self.poll(binding).await;
        }
        if binding.metadata.is_deleting() || binding.status.orphan_mitigation_in_progress {
            return self.unbind(binding).await;
        }
        if binding.is_terminally_failed() {
            return Ok(ReconcileResult::Done);
        }
        self.bind(binding).await
    }

    async fn parent_instance(&self, binding: &ServiceBinding) -> Result<Option<ServiceInstance>, ReconcileError> {
        let namespace = namespace_of(binding);
        let instances: Api<ServiceInstance> = self.ctx.api(Scope::Namespaced);
        let id = ObjectIdRef::new(namespace.as_str(), binding.spec.instance_ref.name.as_str());
        Ok(instances.get(&id).await?)
    }

    /// The parent with the properties its broker knows it by. Returns `None` for an instance
    /// that was never sent to a broker.
    async fn parent(&self, binding: &ServiceBinding) -> Result<Option<Parent>, ReconcileError> {
        let instance = self.parent_instance(binding).await?.ok_or_else(|| {
            ReconcileError::transient(
                reason::REFERENCES_NONEXISTENT_INSTANCE,
                format!(
                    "References a non-existent ServiceInstance {:?}",
                    binding.spec.instance_ref.name
                ),
            )
        })?;
        let props = match instance
            .status
            .external_properties
            .clone()
            .or_else(|| instance.status.in_progress_properties.clone())
        {
            Some(props) => props,
            None => return Ok(None),
        };
        let broker = self
            .ctx
            .get_broker(props.scope, &namespace_of(binding), &props.broker_name)
            .await?
            .ok_or_else(|| {
                ReconcileError::transient(
                    reason::REFERENCES_NONEXISTENT_BROKER,
                    format!("References a non-existent broker {:?}", props.broker_name),
                )
            })?;
        Ok(Some(Parent {
            instance,
            props,
            broker,
        }))
    }

    /// Records why the binding can't proceed yet. A change to the parent instance wakes it up.
    async fn wait(
        &self,
        mut binding: ServiceBinding,
        wait_reason: &'static str,
        message: String,
    ) -> Result<ReconcileResult, ReconcileError> {
        let generation = binding.metadata.generation;
        let status = &mut binding.status;
        let mut changed = status.observed_generation != generation;
        status.observed_generation = generation;
        changed |= status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            wait_reason,
            &message,
            Utc::now(),
        );
        if changed {
            let binding = self.bindings().update_status(&binding).await?;
            log::info!("Binding {}: {}", binding.metadata.id(), message);
            self.ctx.warning(&binding, wait_reason, message);
        }
        Ok(ReconcileResult::Done)
    }

    async fn bind(&self, binding: ServiceBinding) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let namespace = namespace_of(&binding);
        let instance_name = binding.spec.instance_ref.name.clone();

        // there is no update operation for bindings
        if binding.is_ready() && binding.status.unbind_status == UnbindStatus::Required {
            return self.observe_generation(binding).await;
        }

        let instance = match self.parent_instance(&binding).await? {
            Some(instance) => instance,
            None => {
                let message = format!("References a non-existent ServiceInstance {:?}", instance_name);
                return self.wait(binding, reason::REFERENCES_NONEXISTENT_INSTANCE, message).await;
            }
        };
        if instance.status.async_op_in_progress {
            let message = format!(
                "Ongoing asynchronous operation on ServiceInstance {:?}, waiting for it to finish",
                instance_name
            );
            return self.wait(binding, reason::ERROR_ASYNC_OPERATION_IN_PROGRESS, message).await;
        }
        if !instance.is_ready() {
            let message = format!("ServiceInstance {:?} is not ready", instance_name);
            return self.wait(binding, reason::ERROR_PARENT_INSTANCE_NOT_READY, message).await;
        }

        let props = match instance.status.external_properties.clone() {
            Some(props) => props,
            None => {
                let message = format!("ServiceInstance {:?} has not been provisioned", instance_name);
                return self.wait(binding, reason::ERROR_INSTANCE_REFS_UNRESOLVED, message).await;
            }
        };
        let entry_namespace = match props.scope {
            Scope::Cluster => "",
            Scope::Namespaced => namespace.as_str(),
        };
        let class: Option<ServiceClass> = self
            .ctx
            .api(props.scope)
            .get(&ObjectIdRef::new(entry_namespace, props.class_name.as_str()))
            .await?;
        let plan: Option<ServicePlan> = self
            .ctx
            .api(props.scope)
            .get(&ObjectIdRef::new(entry_namespace, props.plan_name.as_str()))
            .await?;
        let (class, plan) = match (class, plan) {
            (Some(class), Some(plan)) => (class, plan),
            _ => {
                let message = format!(
                    "The class or plan of ServiceInstance {:?} no longer exists",
                    instance_name
                );
                return self.wait(binding, reason::ERROR_INSTANCE_REFS_UNRESOLVED, message).await;
            }
        };
        if !plan.is_bindable(&class) {
            let err = ReconcileError::user(
                reason::ERROR_NONBINDABLE_SERVICE_CLASS,
                format!(
                    "References a non-bindable {} {:?} and plan {:?} combination",
                    ServiceClass::k8s_type(props.scope).kind,
                    class.spec.external_name,
                    plan.spec.external_name
                ),
            );
            return self.fail(binding, err, now).await;
        }

        let broker = match self.ctx.get_broker(props.scope, &namespace, &props.broker_name).await? {
            Some(broker) => broker,
            None => {
                let message = format!("References a non-existent broker {:?}", props.broker_name);
                return self.wait(binding, reason::REFERENCES_NONEXISTENT_BROKER, message).await;
            }
        };

        let secrets: Api<Secret> = self.ctx.api(Scope::Namespaced);
        let existing = secrets
            .get(&ObjectIdRef::new(namespace.as_str(), binding.secret_name()))
            .await?;
        if let Some(existing) = existing {
            if !existing.metadata.is_owned_by(&binding.owner_reference(Scope::Namespaced)) {
                let err = ReconcileError::user(
                    reason::ERROR_SECRET_CONFLICT,
                    format!(
                        "Secret {:?} already exists and is not owned by this binding",
                        binding.secret_name()
                    ),
                );
                return self.fail(binding, err, now).await;
            }
        }

        let params = match build_parameters(
            &secrets,
            &namespace,
            binding.spec.parameters.as_ref(),
            &binding.spec.parameters_from,
        )
        .await
        {
            Ok(params) => params,
            Err(err) => return self.fail(binding, err, now).await,
        };
        let identity = match self.ctx.originating_identity(binding.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(err) => return self.fail(binding, err, now).await,
        };

        let mut pending = binding;
        let generation = pending.metadata.generation;
        let checksum = binding_spec_checksum(&pending);
        let status = &mut pending.status;
        status.current_operation = Some(BindingOperation::Bind);
        status.in_progress_properties = Some(BindingProperties {
            parameters: params.redacted.clone(),
            parameter_checksum: params.checksum.clone(),
            checksum,
            user_info: pending.spec.user_info.clone(),
        });
        status.observed_generation = generation;
        status.unbind_status = UnbindStatus::Required;
        status.conditions.remove(ConditionType::Failed);
        if status.operation_start_time.is_none() {
            status.operation_start_time = Some(now);
        }
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            reason::BIND_REQUEST_IN_FLIGHT,
            "Bind request for the binding is in flight",
            now,
        );
        let binding = self.bindings().update_status(&pending).await?;

        let client = match self.ctx.broker_client(&broker).await {
            Ok(client) => client,
            Err(err) => {
                let err = ReconcileError::transient(reason::ERROR_GETTING_AUTH_CREDENTIALS, err.describe());
                return self.fail(binding, err, now).await;
            }
        };
        let request = BindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: class.spec.binding_retrievable,
            service_id: props.class_external_id.clone(),
            plan_id: props.plan_external_id.clone(),
            parameters: params.values,
            bind_resource: None,
            context: RequestContext::kubernetes(&namespace, &self.ctx.config.cluster_id),
            originating_identity: identity,
        };
        log::info!("Binding {} to instance {}", binding.metadata.id(), instance_name);
        match client.bind(&request).await {
            Ok(response) if response.is_async => {
                self.begin_async(binding, response.operation_key, reason::BINDING).await
            }
            Ok(response) => {
                self.bound(binding, response.credentials.unwrap_or_default(), now)
                    .await
            }
            Err(err) if err.is_ambiguous() => {
                let message = format!("Error calling bind: {}", err.describe());
                self.start_orphan_mitigation(binding, reason::BINDING_NEEDS_ORPHAN_MITIGATION, message, now)
                    .await
            }
            Err(err) => {
                let mut binding = binding;
                let failure_reason = if err.is_retryable() {
                    reason::ERROR_CALLING_BIND
                } else {
                    binding.status.unbind_status = UnbindStatus::NotRequired;
                    reason::BIND_CALL_FAILED
                };
                let err = ReconcileError::from_osb(failure_reason, &err);
                self.fail(binding, err, now).await
            }
        }
    }

    async fn observe_generation(&self, mut binding: ServiceBinding) -> Result<ReconcileResult, ReconcileError> {
        let generation = binding.metadata.generation;
        let status = &mut binding.status;
        if status.observed_generation != generation {
            status.observed_generation = generation;
            self.bindings().update_status(&binding).await?;
        }
        Ok(ReconcileResult::Done)
    }

    async fn begin_async(
        &self,
        mut binding: ServiceBinding,
        operation_key: Option<String>,
        async_reason: &'static str,
    ) -> Result<ReconcileResult, ReconcileError> {
        let key = binding.metadata.id().to_owned();
        let message = if async_reason == reason::BINDING {
            "The binding is being created asynchronously"
        } else {
            "The binding is being deleted asynchronously"
        };
        let status = &mut binding.status;
        status.async_op_in_progress = true;
        status.last_operation = operation_key;
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::False, async_reason, message, Utc::now());
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx.normal(&binding, async_reason, message);
        self.polls.reset(&key);
        Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)))
    }

    /// The broker may hold a binding that the controller can't account for. It gets unbound
    /// before anything else happens.
    async fn start_orphan_mitigation(
        &self,
        mut binding: ServiceBinding,
        mitigation_reason: &'static str,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        let status = &mut binding.status;
        status.orphan_mitigation_in_progress = true;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.unbind_status = UnbindStatus::Required;
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::False, mitigation_reason, &message, now);
        let binding = self.bindings().update_status(&binding).await?;
        log::warn!("Binding {} needs orphan mitigation: {}", binding.metadata.id(), message);
        self.ctx.warning(&binding, mitigation_reason, message);
        Ok(ReconcileResult::RequeueWithBackoff)
    }

    /// Reads the secrets the binding's `addKeysFrom` transforms copy from
    async fn added_keys(&self, secrets: &Api<Secret>, binding: &ServiceBinding) -> Result<AddedKeys, ReconcileError> {
        let namespace = namespace_of(binding);
        let mut added = AddedKeys::new();
        for transform in binding.spec.secret_transforms.iter() {
            let secret_ref = match transform {
                SecretTransform::AddKeysFrom { secret_ref } => secret_ref,
                _ => continue,
            };
            let id = added_keys_source(&namespace, secret_ref);
            let secret = secrets.get(&id.as_id_ref()).await?.ok_or_else(|| {
                ReconcileError::transient(
                    reason::ERROR_INJECTING_BIND_RESULT,
                    format!("Secret {} named by an addKeysFrom transform does not exist", id),
                )
            })?;
            let mut decoded = BTreeMap::new();
            for key in secret.data.keys() {
                match secret.get_decoded(key) {
                    Some(Ok(value)) => {
                        decoded.insert(key.clone(), value);
                    }
                    _ => {
                        return Err(ReconcileError::user(
                            reason::ERROR_INJECTING_BIND_RESULT,
                            format!("Secret {} key {:?} is not valid base64", id, key),
                        ))
                    }
                }
            }
            added.insert(id, decoded);
        }
        Ok(added)
    }

    /// Writes the credentials into the binding's secret, creating it if needed. A secret that
    /// exists but isn't owned by the binding is never touched.
    async fn inject(&self, binding: &ServiceBinding, credentials: &JsonObject) -> Result<(), ReconcileError> {
        let namespace = namespace_of(binding);
        let secrets: Api<Secret> = self.ctx.api(Scope::Namespaced);
        let added = self.added_keys(&secrets, binding).await?;
        let entries = credential_entries(credentials, &binding.spec.secret_transforms, &namespace, &added);
        let owner = binding.owner_reference(Scope::Namespaced);
        let id = ObjectIdRef::new(namespace.as_str(), binding.secret_name());

        match secrets.get(&id).await? {
            Some(existing) if !existing.metadata.is_owned_by(&owner) => Err(ReconcileError::user(
                reason::ERROR_SECRET_CONFLICT,
                format!("Secret {} is not owned by the binding", id),
            )),
            Some(mut existing) => {
                existing.data.clear();
                for (key, value) in entries.iter() {
                    existing.insert(key, value);
                }
                secrets.update(&existing).await?;
                Ok(())
            }
            None => {
                let mut secret = Secret::new(&namespace, binding.secret_name());
                secret.metadata.owner_references.push(owner);
                for (key, value) in entries.iter() {
                    secret.insert(key, value);
                }
                secrets.create(&secret).await?;
                Ok(())
            }
        }
    }

    async fn bound(
        &self,
        mut binding: ServiceBinding,
        credentials: JsonObject,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&binding.metadata.id().to_owned());
        if let Err(err) = self.inject(&binding, &credentials).await {
            if err.is_stale_write() {
                return Err(err);
            }
            let message = format!("Error injecting bind result: {}", err.message);
            binding.status.current_operation = None;
            return self
                .start_orphan_mitigation(binding, reason::ERROR_INJECTING_BIND_RESULT, message, now)
                .await;
        }

        let status = &mut binding.status;
        let props = status.in_progress_properties.take();
        status.checksum = props.as_ref().map(|p| p.checksum.clone());
        status.checksum_version = Some(CHECKSUM_VERSION);
        if props.is_some() {
            status.external_properties = props;
        }
        status.current_operation = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.operation_start_time = None;
        status.reconciled_generation = status.observed_generation;
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::True,
            reason::INJECTED_BIND_RESULT,
            "Injected bind result",
            now,
        );
        status.conditions.remove(ConditionType::Failed);
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx
            .normal(&binding, reason::INJECTED_BIND_RESULT, "Injected bind result");
        Ok(ReconcileResult::Done)
    }

    async fn fail(
        &self,
        mut binding: ServiceBinding,
        err: ReconcileError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_stale_write() {
            return Err(err);
        }
        let before = binding.status.clone();
        let generation = binding.metadata.generation;
        let status = &mut binding.status;
        status.observed_generation = generation;
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            err.reason,
            &err.message,
            now,
        );
        let err = match err.kind {
            ErrorKind::Transient | ErrorKind::Ambiguous => {
                if self.ctx.retry_timed_out(status.operation_start_time, now) {
                    let message = format!(
                        "Stopped retrying after {:?}: {}",
                        self.ctx.config.reconciliation_retry_duration, err.message
                    );
                    mark_failed(status, reason::ERROR_RECONCILIATION_RETRY_TIMEOUT, &message, now);
                    ReconcileError::permanent(reason::ERROR_RECONCILIATION_RETRY_TIMEOUT, message)
                } else {
                    if status.operation_start_time.is_none() {
                        status.operation_start_time = Some(now);
                    }
                    status.conditions.remove(ConditionType::Failed);
                    err
                }
            }
            ErrorKind::Internal => {
                status.conditions.remove(ConditionType::Failed);
                err
            }
            ErrorKind::User | ErrorKind::Permanent | ErrorKind::StaleWrite => {
                mark_failed(status, err.reason, &err.message, now);
                err
            }
        };
        let binding = if binding.status != before {
            self.bindings().update_status(&binding).await?
        } else {
            binding
        };
        log::warn!("Binding {}: {}", binding.metadata.id(), err);
        self.ctx.warning(&binding, err.reason, err.message.clone());
        Err(err)
    }

    async fn poll(&self, binding: ServiceBinding) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let key = binding.metadata.id().to_owned();
        let operation = binding.status.current_operation.unwrap_or(BindingOperation::Bind);
        let parent = match self.parent(&binding).await? {
            Some(parent) => parent,
            None => {
                return Err(ReconcileError::transient(
                    reason::ERROR_INSTANCE_REFS_UNRESOLVED,
                    "the parent instance has no recorded broker properties",
                ))
            }
        };
        let client = self.ctx.broker_client(&parent.broker).await.map_err(|err| {
            ReconcileError::transient(reason::ERROR_GETTING_AUTH_CREDENTIALS, err.describe())
        })?;
        let request = BindingLastOperationRequest {
            instance_id: parent.instance.spec.external_id.clone(),
            binding_id: binding.spec.external_id.clone(),
            service_id: Some(parent.props.class_external_id.clone()),
            plan_id: Some(parent.props.plan_external_id.clone()),
            operation_key: binding.status.last_operation.clone(),
            originating_identity: self.ctx.originating_identity(binding.spec.user_info.as_ref())?,
        };

        let response = match client.poll_binding_last_operation(&request).await {
            Ok(response) => response,
            Err(err) => {
                if self.ctx.retry_timed_out(binding.status.operation_start_time, now) {
                    return self.poll_timed_out(binding, operation, now).await;
                }
                let message = format!("Error polling last operation: {}", err.describe());
                let mut binding = binding;
                let changed = binding.status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reason::ERROR_POLLING_LAST_OPERATION,
                    &message,
                    now,
                );
                if changed {
                    binding = self.bindings().update_status(&binding).await?;
                }
                self.ctx.warning(&binding, reason::ERROR_POLLING_LAST_OPERATION, message);
                return Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)));
            }
        };
        log::debug!("Binding {} last operation is {:?}", key, response.state);

        match (response.state, operation) {
            (LastOperationState::InProgress, _) => {
                if self.ctx.retry_timed_out(binding.status.operation_start_time, now) {
                    return self.poll_timed_out(binding, operation, now).await;
                }
                Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)))
            }
            (LastOperationState::Succeeded, BindingOperation::Bind) => {
                let request = GetBindingRequest {
                    instance_id: parent.instance.spec.external_id.clone(),
                    binding_id: binding.spec.external_id.clone(),
                };
                match client.get_binding(&request).await {
                    Ok(response) => {
                        self.bound(binding, response.credentials.unwrap_or_default(), now)
                            .await
                    }
                    Err(err) => {
                        let message = format!("Error fetching the binding credentials: {}", err.describe());
                        self.start_orphan_mitigation(binding, reason::ERROR_INJECTING_BIND_RESULT, message, now)
                            .await
                    }
                }
            }
            (LastOperationState::Succeeded, BindingOperation::Unbind)
            | (LastOperationState::Gone, BindingOperation::Unbind) => self.unbound(binding, now).await,
            (LastOperationState::Failed, _) | (LastOperationState::Gone, BindingOperation::Bind) => {
                let description = response
                    .description
                    .unwrap_or_else(|| "the broker reported a failure".to_owned());
                self.async_failed(binding, operation, description, now).await
            }
        }
    }

    async fn async_failed(
        &self,
        mut binding: ServiceBinding,
        operation: BindingOperation,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&binding.metadata.id().to_owned());
        let (failure_reason, message) = match operation {
            BindingOperation::Bind => (reason::BIND_CALL_FAILED, format!("Bind call failed: {}", description)),
            BindingOperation::Unbind => (
                reason::UNBIND_CALL_FAILED,
                format!("Unbind call failed: {}", description),
            ),
        };
        let status = &mut binding.status;
        mark_failed(status, failure_reason, &message, now);
        if operation == BindingOperation::Unbind {
            status.unbind_status = UnbindStatus::Failed;
        }
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx.warning(&binding, failure_reason, message.clone());
        Err(ReconcileError::permanent(failure_reason, message))
    }

    async fn poll_timed_out(
        &self,
        mut binding: ServiceBinding,
        operation: BindingOperation,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&binding.metadata.id().to_owned());
        let message = format!(
            "Stopped polling the {:?} operation after {:?}",
            operation, self.ctx.config.reconciliation_retry_duration
        );
        let status = &mut binding.status;
        mark_failed(status, reason::ASYNC_OPERATION_TIMEOUT, &message, now);
        match operation {
            BindingOperation::Bind => {
                return self
                    .start_orphan_mitigation(binding, reason::ASYNC_OPERATION_TIMEOUT, message, now)
                    .await
            }
            BindingOperation::Unbind => status.unbind_status = UnbindStatus::Failed,
        }
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx.warning(&binding, reason::ASYNC_OPERATION_TIMEOUT, message.clone());
        Err(ReconcileError::permanent(reason::ASYNC_OPERATION_TIMEOUT, message))
    }

    /// Unbinds a deleting binding, or one in orphan mitigation
    async fn unbind(&self, binding: ServiceBinding) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let orphan = binding.status.orphan_mitigation_in_progress;
        if !orphan {
            if !binding.metadata.has_finalizer(Finalizer::ServiceCatalog) {
                return Ok(ReconcileResult::Done);
            }
            match binding.status.unbind_status {
                UnbindStatus::NotRequired | UnbindStatus::Succeeded => return self.release(binding).await,
                UnbindStatus::Failed => return Ok(ReconcileResult::Done),
                UnbindStatus::Required => {}
            }
        }

        let parent = match self.parent(&binding).await {
            Ok(Some(parent)) => parent,
            Ok(None) => return self.unbound(binding, now).await,
            Err(err) => return self.unbind_failed(binding, err, now).await,
        };
        let identity = self.ctx.originating_identity(binding.spec.user_info.as_ref())?;

        let mut pending = binding;
        let status = &mut pending.status;
        if !orphan && status.current_operation != Some(BindingOperation::Unbind) {
            status.operation_start_time = Some(now);
        }
        status.current_operation = Some(BindingOperation::Unbind);
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            reason::UNBIND_REQUEST_IN_FLIGHT,
            "Unbind request for the binding is in flight",
            now,
        );
        let binding = self.bindings().update_status(&pending).await?;

        let client = match self.ctx.broker_client(&parent.broker).await {
            Ok(client) => client,
            Err(err) => {
                let err = ReconcileError::transient(reason::ERROR_GETTING_AUTH_CREDENTIALS, err.describe());
                return self.unbind_failed(binding, err, now).await;
            }
        };
        let request = UnbindRequest {
            instance_id: parent.instance.spec.external_id.clone(),
            binding_id: binding.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: parent.props.class_external_id.clone(),
            plan_id: parent.props.plan_external_id.clone(),
            originating_identity: identity,
        };
        log::info!("Unbinding {}", binding.metadata.id());
        match client.unbind(&request).await {
            Ok(response) if response.is_async => {
                self.begin_async(binding, response.operation_key, reason::UNBINDING).await
            }
            Ok(_) => self.unbound(binding, now).await,
            Err(err) if err.is_gone() => self.unbound(binding, now).await,
            Err(err) => {
                let err = ReconcileError::from_osb(reason::UNBIND_CALL_FAILED, &err);
                self.unbind_failed(binding, err, now).await
            }
        }
    }

    async fn unbind_failed(
        &self,
        mut binding: ServiceBinding,
        err: ReconcileError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_stale_write() {
            return Err(err);
        }
        let status = &mut binding.status;
        let orphan = status.orphan_mitigation_in_progress;
        let terminal = !orphan
            && (!err.kind.is_retryable() || self.ctx.retry_timed_out(status.operation_start_time, now));
        let err = if terminal {
            let failure_reason = if err.kind.is_retryable() {
                reason::ERROR_RECONCILIATION_RETRY_TIMEOUT
            } else {
                err.reason
            };
            mark_failed(status, failure_reason, &err.message, now);
            status.unbind_status = UnbindStatus::Failed;
            ReconcileError::permanent(failure_reason, err.message)
        } else {
            let failure_reason = if orphan {
                reason::ORPHAN_MITIGATION_FAILED
            } else {
                err.reason
            };
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                failure_reason,
                &err.message,
                now,
            );
            ReconcileError::transient(failure_reason, err.message)
        };
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx.warning(&binding, err.reason, err.message.clone());
        Err(err)
    }

    /// Deletes the credentials secret if the binding owns it
    async fn eject(&self, binding: &ServiceBinding) -> Result<(), ReconcileError> {
        let namespace = namespace_of(binding);
        let secrets: Api<Secret> = self.ctx.api(Scope::Namespaced);
        let id = ObjectIdRef::new(namespace.as_str(), binding.secret_name());
        if let Some(secret) = secrets.get(&id).await? {
            if secret.metadata.is_owned_by(&binding.owner_reference(Scope::Namespaced)) {
                secrets.delete(&id).await?;
            }
        }
        Ok(())
    }

    async fn unbound(&self, mut binding: ServiceBinding, now: DateTime<Utc>) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&binding.metadata.id().to_owned());
        if let Err(err) = self.eject(&binding).await {
            let message = format!("Error deleting the credentials secret: {}", err.message);
            binding.status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::ERROR_EJECTING_BINDING,
                &message,
                now,
            );
            let binding = self.bindings().update_status(&binding).await?;
            self.ctx.warning(&binding, reason::ERROR_EJECTING_BINDING, message.clone());
            return Err(ReconcileError::transient(reason::ERROR_EJECTING_BINDING, message));
        }

        let status = &mut binding.status;
        status.current_operation = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.external_properties = None;

        if status.orphan_mitigation_in_progress {
            status.orphan_mitigation_in_progress = false;
            status.unbind_status = UnbindStatus::NotRequired;
            status.in_progress_properties = None;
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::ORPHAN_MITIGATION_SUCCESSFUL,
                "Orphan mitigation was completed successfully",
                now,
            );
            let binding = self.bindings().update_status(&binding).await?;
            self.ctx.normal(
                &binding,
                reason::ORPHAN_MITIGATION_SUCCESSFUL,
                "Orphan mitigation was completed successfully",
            );
            if binding.metadata.is_deleting() {
                return self.release(binding).await;
            }
            return if binding.is_terminally_failed() {
                Ok(ReconcileResult::Done)
            } else {
                Ok(ReconcileResult::RequeueWithBackoff)
            };
        }

        status.unbind_status = UnbindStatus::Succeeded;
        status.operation_start_time = None;
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            reason::UNBOUND_SUCCESSFULLY,
            "The binding was deleted successfully",
            now,
        );
        let binding = self.bindings().update_status(&binding).await?;
        self.ctx.normal(
            &binding,
            reason::UNBOUND_SUCCESSFULLY,
            "The binding was deleted successfully",
        );
        if binding.metadata.is_deleting() {
            self.release(binding).await
        } else {
            Ok(ReconcileResult::Done)
        }
    }

    async fn release(&self, binding: ServiceBinding) -> Result<ReconcileResult, ReconcileError> {
        let key = binding.metadata.id().to_owned();
        self.polls.reset(&key);
        if binding.metadata.has_finalizer(Finalizer::ServiceCatalog) {
            log::info!("Removing {} finalizer from binding {}", Finalizer::ServiceCatalog, key);
            let patch = Patch::remove_finalizer(&binding.metadata, Finalizer::ServiceCatalog);
            self.bindings().patch(&key.as_id_ref(), &patch).await?;
        }
        Ok(ReconcileResult::Done)
    }
}

#[async_trait]
impl Reconciler for BindingReconciler {
    fn name(&self) -> &'static str {
        "service-binding"
    }

    fn owned_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ServiceBinding]
    }

    fn related_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ServiceInstance]
    }

    async fn keys_for_related(&self, _k8s_type: &'static K8sType, object: &Value) -> Vec<ObjectId> {
        let instance = match serde_json::from_value::<ServiceInstance>(object.clone()) {
            Ok(instance) => instance,
            Err(err) => {
                log::warn!("Ignoring undecodable instance: {}", err);
                return Vec::new();
            }
        };
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let params = ListParams::all().in_namespace(Some(namespace.as_str()));
        match self.bindings().list(&params).await {
            Ok(bindings) => bindings
                .into_iter()
                .filter(|b| b.spec.instance_ref.name == instance.metadata.name)
                .map(|b| ObjectId::new(namespace.clone(), b.metadata.name))
                .collect(),
            Err(err) => {
                log::error!("Failed to list bindings of instance {}/{}: {}", namespace, instance.metadata.name, err);
                Vec::new()
            }
        }
    }

    async fn reconcile(&self, key: &ObjectId) -> ReconcileResult {
        self.reconcile_binding(key).await.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::osb::{BindResponse, GetBindingResponse, LastOperationResponse, OsbError, ProvisionResponse};
    use crate::runner::testkit::{test_binding, test_instance, TestKit};

    use serde_json::json;

    fn binding_key() -> ObjectId {
        ObjectId::new("test-ns", "test-binding")
    }

    async fn get_binding(kit: &TestKit) -> ServiceBinding {
        kit.get(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .expect("binding should exist")
    }

    fn credentials(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn status_error(status: u16) -> OsbError {
        OsbError::HttpStatus {
            status,
            error: None,
            description: None,
        }
    }

    async fn ready_instance(kit: &TestKit) {
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.settle().await;
    }

    #[test]
    fn add_keys_from_copies_fetched_entries() {
        let creds = credentials(json!({"user": "admin"}));
        let mut tls = BTreeMap::new();
        tls.insert("ca.crt".to_owned(), b"CERT".to_vec());
        let mut added = AddedKeys::new();
        added.insert(ObjectId::new("test-ns", "tls"), tls);

        let entries = credential_entries(
            &creds,
            &[
                SecretTransform::AddKeysFrom {
                    secret_ref: ObjectReference {
                        namespace: None,
                        name: "tls".to_owned(),
                    },
                },
                SecretTransform::RemoveKey { key: "user".to_owned() },
            ],
            "test-ns",
            &added,
        );
        assert_eq!(vec!["ca.crt"], entries.keys().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(b"CERT".to_vec(), entries["ca.crt"]);
    }

    #[test]
    fn credentials_are_flattened_and_transformed() {
        let creds = credentials(json!({"user": "admin", "port": 5432, "tls": {"ca": "x"}}));
        let entries = credential_entries(
            &creds,
            &[
                SecretTransform::RenameKey {
                    from: "user".to_owned(),
                    to: "username".to_owned(),
                },
                SecretTransform::AddKey {
                    key: "driver".to_owned(),
                    value: "postgres".to_owned(),
                },
                SecretTransform::RemoveKey { key: "tls".to_owned() },
            ],
            "test-ns",
            &AddedKeys::new(),
        );
        let keys: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(vec!["driver", "port", "username"], keys);
        assert_eq!(b"admin".to_vec(), entries["username"]);
        assert_eq!(b"5432".to_vec(), entries["port"]);
    }

    #[tokio::test]
    async fn bind_injects_credentials_into_an_owned_secret() {
        let kit = TestKit::with_ready_broker().await;
        kit.broker.on_bind(Ok(BindResponse {
            is_async: false,
            credentials: Some(credentials(json!({"password": "hunter2"}))),
            operation_key: None,
        }));
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        let binding = get_binding(&kit).await;
        assert!(binding.is_ready());
        assert_eq!(UnbindStatus::Required, binding.status.unbind_status);
        let secret: Secret = kit
            .get(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .expect("secret should exist");
        assert_eq!(Some("hunter2".to_owned()), secret.get_string("password"));
        assert!(secret
            .metadata
            .is_owned_by(&binding.owner_reference(Scope::Namespaced)));

        let binds = kit.broker.bind_calls();
        assert_eq!(1, binds.len());
        assert_eq!(binding.spec.external_id, binds[0].binding_id);
        assert_eq!("SCGUID", binds[0].service_id);
    }

    #[tokio::test]
    async fn binding_waits_for_the_instance_async_operation() {
        let kit = TestKit::with_ready_broker().await;
        kit.broker.on_provision(Ok(ProvisionResponse {
            is_async: true,
            dashboard_url: None,
            operation_key: Some("op-1".to_owned()),
        }));
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.reconcile_key("service-instance", &ObjectId::new("test-ns", "test-instance"))
            .await;
        kit.create(Scope::Namespaced, &test_binding()).await;

        let result = kit.reconcile_key("service-binding", &binding_key()).await;
        assert_eq!(ReconcileResult::Done, result);
        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::ERROR_ASYNC_OPERATION_IN_PROGRESS),
            binding.status.conditions.reason(ConditionType::Ready)
        );
        assert!(kit.broker.bind_calls().is_empty());

        kit.broker.on_poll(Ok(LastOperationResponse::new(LastOperationState::Succeeded)));
        kit.settle().await;
        assert!(get_binding(&kit).await.is_ready());
        assert_eq!(1, kit.broker.bind_calls().len());
    }

    #[tokio::test]
    async fn foreign_secrets_are_never_overwritten() {
        let kit = TestKit::with_ready_broker().await;
        kit.create(Scope::Namespaced, &Secret::new("test-ns", "test-binding").with_entry("a", b"b"))
            .await;
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::ERROR_SECRET_CONFLICT),
            binding.status.conditions.reason(ConditionType::Failed)
        );
        assert!(kit.broker.bind_calls().is_empty());
        let secret: Secret = kit.get(Scope::Namespaced, "test-ns", "test-binding").await.unwrap();
        assert_eq!(Some("b".to_owned()), secret.get_string("a"));
    }

    #[tokio::test]
    async fn deletion_unbinds_and_removes_the_secret() {
        let kit = TestKit::with_ready_broker().await;
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        kit.delete::<ServiceBinding>(Scope::Namespaced, "test-ns", "test-binding").await;
        kit.settle().await;

        let unbinds = kit.broker.unbind_calls();
        assert_eq!(1, unbinds.len());
        assert!(kit
            .get::<ServiceBinding>(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .is_none());
        assert!(kit
            .get::<Secret>(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn ambiguous_bind_failure_is_unbound_before_retrying() {
        let kit = TestKit::with_ready_broker().await;
        kit.broker.on_bind(Err(OsbError::Transport {
            message: "deadline exceeded".to_owned(),
            timed_out: true,
        }));
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        assert_eq!(1, kit.broker.unbind_calls().len());
        assert_eq!(2, kit.broker.bind_calls().len());
        assert!(get_binding(&kit).await.is_ready());
        assert!(kit
            .events
            .reasons_for(&binding_key())
            .contains(&reason::BINDING_NEEDS_ORPHAN_MITIGATION.to_owned()));
    }

    #[tokio::test]
    async fn binding_waits_while_the_instance_is_not_ready() {
        let kit = TestKit::with_ready_broker().await;
        kit.broker.on_provision(Err(status_error(400)));
        kit.create(Scope::Namespaced, &test_instance()).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::ERROR_PARENT_INSTANCE_NOT_READY),
            binding.status.conditions.reason(ConditionType::Ready)
        );
        assert!(!binding.is_failed());
        assert!(kit.broker.bind_calls().is_empty());
    }

    #[tokio::test]
    async fn non_bindable_plans_fail_the_binding() {
        let kit = TestKit::with_ready_broker().await;
        let mut plan = kit.list::<ServicePlan>(Scope::Cluster).await.remove(0);
        plan.spec.bindable = Some(false);
        kit.update(Scope::Cluster, &plan).await;
        ready_instance(&kit).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::ERROR_NONBINDABLE_SERVICE_CLASS),
            binding.status.conditions.reason(ConditionType::Failed)
        );
        assert!(kit.broker.bind_calls().is_empty());
        assert_eq!(
            ReconcileResult::Done,
            kit.reconcile_key("service-binding", &binding_key()).await
        );
    }

    #[tokio::test]
    async fn bind_after_a_rejected_bind_is_mitigated_and_retried() {
        let kit = TestKit::with_ready_broker().await;
        ready_instance(&kit).await;
        kit.broker.on_bind(Err(status_error(400)));
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;
        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::BIND_CALL_FAILED),
            binding.status.conditions.reason(ConditionType::Failed)
        );

        kit.broker.on_bind(Err(status_error(503)));
        let mut changed = binding;
        changed.spec.parameters = Some(json!({"role": "admin"}));
        kit.update(Scope::Namespaced, &changed).await;
        kit.settle().await;

        assert_eq!(3, kit.broker.bind_calls().len());
        assert_eq!(1, kit.broker.unbind_calls().len());
        let binding = get_binding(&kit).await;
        assert!(binding.is_ready());
        assert!(!binding.is_failed());
    }

    #[tokio::test]
    async fn async_bind_is_polled_then_credentials_are_fetched() {
        let kit = TestKit::with_ready_broker().await;
        let mut class = kit.list::<ServiceClass>(Scope::Cluster).await.remove(0);
        class.spec.binding_retrievable = true;
        kit.update(Scope::Cluster, &class).await;
        ready_instance(&kit).await;

        kit.broker.on_bind(Ok(BindResponse {
            is_async: true,
            credentials: None,
            operation_key: Some("bind-op".to_owned()),
        }));
        kit.broker
            .on_poll_binding(Ok(LastOperationResponse::new(LastOperationState::InProgress)));
        kit.broker
            .on_poll_binding(Ok(LastOperationResponse::new(LastOperationState::Succeeded)));
        kit.broker.on_get_binding(Ok(GetBindingResponse {
            credentials: Some(credentials(json!({"password": "hunter2"}))),
        }));
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        let binds = kit.broker.bind_calls();
        assert_eq!(1, binds.len());
        assert!(binds[0].accepts_incomplete);
        let polls = kit.broker.poll_binding_calls();
        assert_eq!(2, polls.len());
        assert!(polls.iter().all(|p| p.operation_key.as_deref() == Some("bind-op")));
        assert_eq!(1, kit.broker.get_binding_calls().len());

        let binding = get_binding(&kit).await;
        assert!(binding.is_ready());
        assert!(!binding.status.async_op_in_progress);
        let secret: Secret = kit.get(Scope::Namespaced, "test-ns", "test-binding").await.unwrap();
        assert_eq!(Some("hunter2".to_owned()), secret.get_string("password"));
    }

    #[tokio::test]
    async fn async_bind_past_the_retry_duration_is_unbound() {
        let kit = TestKit::with_ready_broker().await;
        ready_instance(&kit).await;
        kit.broker.on_bind(Ok(BindResponse {
            is_async: true,
            credentials: None,
            operation_key: None,
        }));
        kit.broker
            .on_poll_binding(Ok(LastOperationResponse::new(LastOperationState::InProgress)));
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.reconcile_key("service-binding", &binding_key()).await;

        let mut binding = get_binding(&kit).await;
        assert!(binding.status.async_op_in_progress);
        binding.status.operation_start_time = Some(Utc::now() - chrono::Duration::hours(1));
        kit.context
            .api::<ServiceBinding>(Scope::Namespaced)
            .update_status(&binding)
            .await
            .unwrap();
        kit.settle().await;

        assert_eq!(1, kit.broker.bind_calls().len());
        assert_eq!(1, kit.broker.unbind_calls().len());
        let binding = get_binding(&kit).await;
        assert_eq!(
            Some(reason::ASYNC_OPERATION_TIMEOUT),
            binding.status.conditions.reason(ConditionType::Failed)
        );
        assert!(!binding.status.orphan_mitigation_in_progress);
    }

    #[tokio::test]
    async fn gone_on_unbind_counts_as_unbound() {
        let kit = TestKit::with_ready_broker().await;
        ready_instance(&kit).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.settle().await;

        kit.broker.on_unbind(Err(status_error(410)));
        kit.delete::<ServiceBinding>(Scope::Namespaced, "test-ns", "test-binding").await;
        kit.settle().await;

        assert_eq!(1, kit.broker.unbind_calls().len());
        assert!(kit
            .get::<ServiceBinding>(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .is_none());
        assert!(kit
            .get::<Secret>(Scope::Namespaced, "test-ns", "test-binding")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn add_keys_from_copies_another_secret_into_the_binding_secret() {
        let kit = TestKit::with_ready_broker().await;
        ready_instance(&kit).await;
        kit.broker.on_bind(Ok(BindResponse {
            is_async: false,
            credentials: Some(credentials(json!({"password": "hunter2"}))),
            operation_key: None,
        }));
        let mut binding = test_binding();
        binding.spec.secret_transforms = vec![SecretTransform::AddKeysFrom {
            secret_ref: ObjectReference {
                namespace: Some("shared".to_owned()),
                name: "tls".to_owned(),
            },
        }];
        kit.create(Scope::Namespaced, &Secret::new("shared", "tls").with_entry("ca.crt", b"CERT"))
            .await;
        kit.create(Scope::Namespaced, &binding).await;
        kit.settle().await;

        assert!(get_binding(&kit).await.is_ready());
        let secret: Secret = kit.get(Scope::Namespaced, "test-ns", "test-binding").await.unwrap();
        assert_eq!(Some("CERT".to_owned()), secret.get_string("ca.crt"));
        assert_eq!(Some("hunter2".to_owned()), secret.get_string("password"));
    }

    #[tokio::test]
    async fn instance_changes_map_to_the_bindings_that_reference_it() {
        let kit = TestKit::with_ready_broker().await;
        ready_instance(&kit).await;
        kit.create(Scope::Namespaced, &test_binding()).await;
        kit.create(
            Scope::Namespaced,
            &ServiceBinding::new("test-ns", "other-binding", "other-instance"),
        )
        .await;

        let instance: ServiceInstance = kit
            .get(Scope::Namespaced, "test-ns", "test-instance")
            .await
            .unwrap();
        let reconciler = BindingReconciler::new(kit.context.clone());
        let keys = reconciler
            .keys_for_related(v1beta1::ServiceInstance, &serde_json::to_value(&instance).unwrap())
            .await;
        assert_eq!(vec![binding_key()], keys);
    }
}
