use crate::checksum::{instance_spec_checksum, CHECKSUM_VERSION};
use crate::controller::parameters::{apply_defaults, build_parameters, catalog_defaults};
use crate::controller::{reason, ControllerContext};
use crate::filter::Selector;
use crate::handler::backoff::KeyedBackoff;
use crate::handler::{ErrorKind, ReconcileError, ReconcileResult, Reconciler};
use crate::k8s_types::{v1beta1, K8sType};
use crate::osb::{
    DeprovisionRequest, LastOperationRequest, LastOperationState, OsbError, PreviousValues,
    ProvisionRequest, RequestContext, UpdateInstanceRequest,
};
use crate::resource::{
    Broker, ConditionStatus, ConditionType, DeprovisionStatus, EntryRef, Finalizer,
    InstanceOperation, InstanceProperties, InstanceStatus, ObjectId, ObjectIdRef,
    ProvisionStatus, Resource, ResolvedReferences, Scope, Secret, ServiceBinding, ServiceClass,
    ServiceInstance, ServicePlan,
};
use crate::store::{Api, ListParams, Patch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use std::time::Duration;

/// Provisions, updates and deprovisions instances, one outstanding broker operation at a time
pub struct InstanceReconciler {
    ctx: ControllerContext,
    polls: KeyedBackoff<ObjectId>,
}

/// The catalog entries and broker an instance's plan reference points at
#[derive(Debug)]
struct Resolved {
    scope: Scope,
    broker: Broker,
    class: ServiceClass,
    plan: ServicePlan,
}

impl Resolved {
    fn references(&self) -> ResolvedReferences {
        ResolvedReferences {
            scope: self.scope,
            class_name: self.class.metadata.name.clone(),
            plan_name: self.plan.metadata.name.clone(),
        }
    }
}

fn namespace_of(instance: &ServiceInstance) -> String {
    instance.metadata.namespace.clone().unwrap_or_default()
}

/// Records a terminal failure. The instance is left alone until its spec changes.
fn mark_failed(status: &mut InstanceStatus, failure_reason: &'static str, message: &str, now: DateTime<Utc>) {
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

fn pick_one<R: Resource>(
    mut found: Vec<R>,
    scope: Scope,
    entry: &EntryRef,
    missing_reason: &'static str,
) -> Result<R, ReconcileError> {
    let kind = R::k8s_type(scope).kind;
    match found.len() {
        1 => found.pop().ok_or_else(|| ReconcileError::internal(missing_reason, "lost a match")),
        0 => Err(ReconcileError::user(
            missing_reason,
            format!("References a non-existent {} {}", kind, entry),
        )),
        n => Err(ReconcileError::user(
            missing_reason,
            format!("{} matches {} {} objects, expected exactly one", entry, n, kind),
        )),
    }
}

fn entry_ref(
    entry: Result<Option<EntryRef>, usize>,
    missing_reason: &'static str,
    what: &str,
) -> Result<EntryRef, ReconcileError> {
    match entry {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => Err(ReconcileError::user(missing_reason, format!("no service {} specified", what))),
        Err(n) => Err(ReconcileError::user(
            missing_reason,
            format!("exactly one service {} specifier must be set, found {}", what, n),
        )),
    }
}

impl InstanceReconciler {
    pub fn new(ctx: ControllerContext) -> InstanceReconciler {
        let polls = KeyedBackoff::new(ctx.config.poll_backoff.clone());
        InstanceReconciler { ctx, polls }
    }

    fn instances(&self) -> Api<ServiceInstance> {
        self.ctx.api(Scope::Namespaced)
    }

    fn next_poll(&self, key: &ObjectId) -> Duration {
        self.polls
            .next_backoff(key)
            .unwrap_or(self.polls.config().max_interval)
    }

    async fn reconcile_instance(&self, key: &ObjectId) -> Result<ReconcileResult, ReconcileError> {
        let instance = match self.instances().get(&key.as_id_ref()).await? {
            Some(instance) => instance,
            None => {
                self.polls.reset(key);
                return Ok(ReconcileResult::Done);
            }
        };

        if instance.status.async_op_in_progress {
            return self.poll(instance).await;
        }
        if instance.metadata.is_deleting() || instance.status.orphan_mitigation_in_progress {
            return self.deprovision(instance).await;
        }
        if instance.is_terminally_failed() {
            log::debug!("Instance {} has failed, waiting for a spec change", key);
            return Ok(ReconcileResult::Done);
        }
        self.provision_or_update(instance).await
    }

    /// Looks up exactly one entry of the given kind. Name references are direct gets, the
    /// others are field selector lists. `accept` narrows down the matches.
    async fn find<R: Resource>(
        &self,
        scope: Scope,
        namespace: &str,
        entry: &EntryRef,
        accept: impl Fn(&R) -> bool,
    ) -> Result<Vec<R>, ReconcileError> {
        let api: Api<R> = self.ctx.api(scope);
        let namespace = match scope {
            Scope::Cluster => "",
            Scope::Namespaced => namespace,
        };
        let found = match entry {
            EntryRef::Name(name) => api
                .get(&ObjectIdRef::new(namespace, name.as_str()))
                .await?
                .into_iter()
                .collect::<Vec<R>>(),
            other => {
                let selector = Selector::parse(&other.field_selector()).map_err(|err| {
                    ReconcileError::user(
                        reason::REFERENCES_NONEXISTENT_SERVICE_CLASS,
                        format!("invalid reference {}: {}", other, err),
                    )
                })?;
                let params = ListParams::all()
                    .in_namespace(Some(namespace).filter(|ns| !ns.is_empty()))
                    .fields(selector);
                api.list(&params).await?
            }
        };
        Ok(found.into_iter().filter(|r| accept(r)).collect())
    }

    async fn resolve(&self, instance: &ServiceInstance) -> Result<Resolved, ReconcileError> {
        let plan_ref = &instance.spec.plan_reference;
        let scope = plan_ref.scope();
        let namespace = namespace_of(instance);

        let class_ref = entry_ref(plan_ref.class_ref(), reason::REFERENCES_NONEXISTENT_SERVICE_CLASS, "class")?;
        let classes = self
            .find::<ServiceClass>(scope, &namespace, &class_ref, |_| true)
            .await?;
        let class = pick_one(classes, scope, &class_ref, reason::REFERENCES_NONEXISTENT_SERVICE_CLASS)?;

        let plan_entry = entry_ref(plan_ref.plan_ref(), reason::REFERENCES_NONEXISTENT_SERVICE_PLAN, "plan")?;
        let plans = self
            .find::<ServicePlan>(scope, &namespace, &plan_entry, |plan| {
                plan.spec.service_class_ref.name == class.metadata.name
                    && plan.spec.broker_name == class.spec.broker_name
            })
            .await?;
        let plan = pick_one(plans, scope, &plan_entry, reason::REFERENCES_NONEXISTENT_SERVICE_PLAN)?;

        let broker = self
            .ctx
            .get_broker(scope, &namespace, &class.spec.broker_name)
            .await?
            .ok_or_else(|| {
                ReconcileError::user(
                    reason::REFERENCES_NONEXISTENT_BROKER,
                    format!(
                        "References a non-existent {} {:?}",
                        Broker::k8s_type(scope).kind,
                        class.spec.broker_name
                    ),
                )
            })?;
        Ok(Resolved {
            scope,
            broker,
            class,
            plan,
        })
    }

    async fn provision_or_update(&self, instance: ServiceInstance) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let key = instance.metadata.id().to_owned();
        let namespace = namespace_of(&instance);

        let resolved = match self.resolve(&instance).await {
            Ok(resolved) => resolved,
            Err(err) => return self.fail(instance, err, now).await,
        };
        let secrets: Api<Secret> = self.ctx.api(Scope::Namespaced);
        let params = match build_parameters(
            &secrets,
            &namespace,
            instance.spec.parameters.as_ref(),
            &instance.spec.parameters_from,
        )
        .await
        {
            Ok(params) => params,
            Err(err) => return self.fail(instance, err, now).await,
        };
        let defaults = instance.status.default_provision_parameters.clone().or_else(|| {
            catalog_defaults(
                resolved.class.spec.default_provision_parameters.as_ref(),
                resolved.plan.spec.default_provision_parameters.as_ref(),
            )
        });
        let params = match apply_defaults(params, defaults.as_ref()) {
            Ok(params) => params,
            Err(msg) => {
                let err = ReconcileError::user(reason::ERROR_WITH_PARAMETERS, msg);
                return self.fail(instance, err, now).await;
            }
        };
        let references = resolved.references();
        let checksum = instance_spec_checksum(&instance, &references);

        let status = &instance.status;
        let provisioned = status.provision_status == ProvisionStatus::Provisioned;
        let in_sync = provisioned
            && status.checksum.as_deref() == Some(checksum.as_str())
            && status.checksum_version == Some(CHECKSUM_VERSION)
            && status.external_properties.as_ref().map(|p| &p.parameter_checksum) == Some(&params.checksum);
        if in_sync {
            return self.observe_generation(instance).await;
        }

        let plan_changed = status
            .external_properties
            .as_ref()
            .map(|p| p.plan_name != resolved.plan.metadata.name)
            .unwrap_or(true);
        if !provisioned || plan_changed {
            let deleted = if resolved.class.status.removed_from_broker_catalog {
                Some((reason::REFERENCES_DELETED_SERVICE_CLASS, ServiceClass::k8s_type(resolved.scope).kind, &resolved.class.metadata.name))
            } else if resolved.plan.status.removed_from_broker_catalog {
                Some((reason::REFERENCES_DELETED_SERVICE_PLAN, ServicePlan::k8s_type(resolved.scope).kind, &resolved.plan.metadata.name))
            } else {
                None
            };
            if let Some((deleted_reason, kind, name)) = deleted {
                let err = ReconcileError::user(
                    deleted_reason,
                    format!("References a deleted {} {:?} that has been removed from the broker catalog", kind, name),
                );
                return self.fail(instance, err, now).await;
            }
        }

        let identity = match self.ctx.originating_identity(instance.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(err) => return self.fail(instance, err, now).await,
        };
        let space_guid = self.ctx.space_guid(&namespace).await?;

        let props = InstanceProperties {
            scope: resolved.scope,
            broker_name: resolved.broker.metadata.name.clone(),
            class_name: resolved.class.metadata.name.clone(),
            class_external_id: resolved.class.spec.external_id.clone(),
            plan_name: resolved.plan.metadata.name.clone(),
            plan_external_name: resolved.plan.spec.external_name.clone(),
            plan_external_id: resolved.plan.spec.external_id.clone(),
            parameters: params.redacted.clone(),
            parameter_checksum: params.checksum.clone(),
            checksum,
            user_info: instance.spec.user_info.clone(),
        };
        let operation = if provisioned {
            InstanceOperation::Update
        } else {
            InstanceOperation::Provision
        };
        let previous = instance.status.external_properties.clone();

        let mut pending = instance;
        let generation = pending.metadata.generation;
        let status = &mut pending.status;
        status.current_operation = Some(operation);
        status.in_progress_properties = Some(props.clone());
        status.resolved_references = Some(references);
        status.observed_generation = generation;
        status.conditions.remove(ConditionType::Failed);
        if status.default_provision_parameters.is_none() {
            status.default_provision_parameters = defaults;
        }
        if status.operation_start_time.is_none() {
            status.operation_start_time = Some(now);
        }
        let (in_flight, message) = match operation {
            InstanceOperation::Provision => {
                status.deprovision_status = DeprovisionStatus::Required;
                (reason::PROVISION_REQUEST_IN_FLIGHT, "Provision request for the instance is in flight")
            }
            _ => (reason::UPDATE_REQUEST_IN_FLIGHT, "Update request for the instance is in flight"),
        };
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::False, in_flight, message, now);
        let instance = self.instances().update_status(&pending).await?;

        let client = match self.ctx.broker_client(&resolved.broker).await {
            Ok(client) => client,
            Err(err) => {
                let err = ReconcileError::transient(
                    reason::ERROR_GETTING_AUTH_CREDENTIALS,
                    format!("Error getting broker auth credentials: {}", err.describe()),
                );
                return self.fail(instance, err, now).await;
            }
        };
        let context = RequestContext::kubernetes(&namespace, &self.ctx.config.cluster_id);

        match operation {
            InstanceOperation::Provision => {
                let request = ProvisionRequest {
                    instance_id: instance.spec.external_id.clone(),
                    accepts_incomplete: true,
                    service_id: props.class_external_id.clone(),
                    plan_id: props.plan_external_id.clone(),
                    organization_guid: self.ctx.config.cluster_id.clone(),
                    space_guid,
                    parameters: params.values,
                    context,
                    originating_identity: identity,
                };
                log::info!("Provisioning instance {} with plan {}", key, props.plan_external_id);
                match client.provision_instance(&request).await {
                    Ok(response) if response.is_async => {
                        self.begin_async(instance, response.operation_key, response.dashboard_url, reason::PROVISIONING)
                            .await
                    }
                    Ok(response) => self.operation_succeeded(instance, response.dashboard_url, now).await,
                    Err(err) => self.provision_failed(instance, err, now).await,
                }
            }
            _ => {
                let plan_id = match previous.as_ref() {
                    Some(prev) if prev.plan_external_id == props.plan_external_id => None,
                    _ => Some(props.plan_external_id.clone()),
                };
                let request = UpdateInstanceRequest {
                    instance_id: instance.spec.external_id.clone(),
                    accepts_incomplete: true,
                    service_id: props.class_external_id.clone(),
                    plan_id,
                    parameters: params.values,
                    previous_values: previous.map(|prev| PreviousValues {
                        service_id: prev.class_external_id,
                        plan_id: prev.plan_external_id,
                    }),
                    context,
                    originating_identity: identity,
                };
                log::info!("Updating instance {}", key);
                match client.update_instance(&request).await {
                    Ok(response) if response.is_async => {
                        self.begin_async(instance, response.operation_key, response.dashboard_url, reason::UPDATING_INSTANCE)
                            .await
                    }
                    Ok(response) => self.operation_succeeded(instance, response.dashboard_url, now).await,
                    Err(err) => {
                        let failure_reason = if err.is_retryable() {
                            reason::ERROR_CALLING_UPDATE_INSTANCE
                        } else {
                            reason::UPDATE_INSTANCE_CALL_FAILED
                        };
                        let err = ReconcileError::from_osb(failure_reason, &err);
                        self.fail(instance, err, now).await
                    }
                }
            }
        }
    }

    /// Nothing to send to the broker. Only the generations may need catching up.
    async fn observe_generation(&self, mut instance: ServiceInstance) -> Result<ReconcileResult, ReconcileError> {
        let generation = instance.metadata.generation;
        let status = &mut instance.status;
        let mut changed = status.observed_generation != generation || status.reconciled_generation != generation;
        status.observed_generation = generation;
        status.reconciled_generation = generation;
        // the spec went back to what the broker already holds
        if status.conditions.remove(ConditionType::Failed) {
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::True,
                reason::PROVISIONED_SUCCESSFULLY,
                "The instance was provisioned successfully",
                Utc::now(),
            );
            changed = true;
        }
        if changed {
            self.instances().update_status(&instance).await?;
        }
        Ok(ReconcileResult::Done)
    }

    async fn begin_async(
        &self,
        mut instance: ServiceInstance,
        operation_key: Option<String>,
        dashboard_url: Option<String>,
        async_reason: &'static str,
    ) -> Result<ReconcileResult, ReconcileError> {
        let key = instance.metadata.id().to_owned();
        let message = match async_reason {
            reason::PROVISIONING => "The instance is being provisioned asynchronously",
            reason::UPDATING_INSTANCE => "The instance is being updated asynchronously",
            _ => "The instance is being deprovisioned asynchronously",
        };
        let status = &mut instance.status;
        status.async_op_in_progress = true;
        status.last_operation = operation_key;
        if dashboard_url.is_some() {
            status.dashboard_url = dashboard_url;
        }
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::False, async_reason, message, Utc::now());
        let instance = self.instances().update_status(&instance).await?;
        self.ctx.normal(&instance, async_reason, message);

        self.polls.reset(&key);
        Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)))
    }

    /// Completes a provision or update, pinning the in-progress properties as the ones the
    /// broker now holds
    async fn operation_succeeded(
        &self,
        mut instance: ServiceInstance,
        dashboard_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&instance.metadata.id().to_owned());
        let (success_reason, message) = match instance.status.current_operation {
            Some(InstanceOperation::Update) => (
                reason::INSTANCE_UPDATED_SUCCESSFULLY,
                "The instance was updated successfully",
            ),
            _ => (reason::PROVISIONED_SUCCESSFULLY, "The instance was provisioned successfully"),
        };
        let status = &mut instance.status;
        let props = status.in_progress_properties.take();
        status.checksum = props.as_ref().map(|p| p.checksum.clone());
        status.checksum_version = Some(CHECKSUM_VERSION);
        if props.is_some() {
            status.external_properties = props;
        }
        status.provision_status = ProvisionStatus::Provisioned;
        status.deprovision_status = DeprovisionStatus::Required;
        status.current_operation = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.operation_start_time = None;
        if dashboard_url.is_some() {
            status.dashboard_url = dashboard_url;
        }
        status.reconciled_generation = status.observed_generation;
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::True, success_reason, message, now);
        status.conditions.remove(ConditionType::Failed);

        let instance = self.instances().update_status(&instance).await?;
        log::info!("Instance {}: {}", instance.metadata.id(), message);
        self.ctx.normal(&instance, success_reason, message);
        Ok(ReconcileResult::Done)
    }

    /// A provision whose outcome at the broker is unknown starts orphan mitigation. Everything
    /// else is either retried or recorded as a failure.
    async fn provision_failed(
        &self,
        mut instance: ServiceInstance,
        err: OsbError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_ambiguous() {
            let message = format!("Error provisioning the instance: {}", err.describe());
            log::warn!("Instance {} needs orphan mitigation: {}", instance.metadata.id(), message);
            let status = &mut instance.status;
            status.orphan_mitigation_in_progress = true;
            status.deprovision_status = DeprovisionStatus::Required;
            status.conditions.set(
                ConditionType::OrphanMitigation,
                ConditionStatus::True,
                reason::STARTING_ORPHAN_MITIGATION,
                "The instance provision call failed with an ambiguous error; attempting to deprovision the instance in order to mitigate an orphaned resource",
                now,
            );
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::ERROR_CALLING_PROVISION,
                &message,
                now,
            );
            let instance = self.instances().update_status(&instance).await?;
            self.ctx.warning(&instance, reason::STARTING_ORPHAN_MITIGATION, message);
            return Ok(ReconcileResult::RequeueWithBackoff);
        }

        let failure_reason = if err.is_retryable() {
            reason::ERROR_CALLING_PROVISION
        } else {
            instance.status.deprovision_status = DeprovisionStatus::NotRequired;
            reason::PROVISION_CALL_FAILED
        };
        let err = ReconcileError::from_osb(failure_reason, &err);
        self.fail(instance, err, now).await
    }

    /// Records a failed attempt in status. Transient failures are retried until the
    /// reconciliation retry duration runs out, then they become terminal too.
    async fn fail(
        &self,
        mut instance: ServiceInstance,
        err: ReconcileError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_stale_write() {
            return Err(err);
        }
        let before = instance.status.clone();
        let generation = instance.metadata.generation;
        let status = &mut instance.status;
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

        let instance = if instance.status != before {
            self.instances().update_status(&instance).await?
        } else {
            instance
        };
        log::warn!("Instance {}: {}", instance.metadata.id(), err);
        self.ctx.warning(&instance, err.reason, err.message.clone());
        Err(err)
    }

    /// Properties of the operation being polled
    fn polled_properties(instance: &ServiceInstance) -> Option<InstanceProperties> {
        let status = &instance.status;
        match status.current_operation {
            Some(InstanceOperation::Deprovision) => status
                .external_properties
                .clone()
                .or_else(|| status.in_progress_properties.clone()),
            _ => status
                .in_progress_properties
                .clone()
                .or_else(|| status.external_properties.clone()),
        }
    }

    async fn broker_for(
        &self,
        instance: &ServiceInstance,
        props: &InstanceProperties,
    ) -> Result<Broker, ReconcileError> {
        self.ctx
            .get_broker(props.scope, &namespace_of(instance), &props.broker_name)
            .await?
            .ok_or_else(|| {
                ReconcileError::transient(
                    reason::REFERENCES_NONEXISTENT_BROKER,
                    format!(
                        "References a non-existent {} {:?}",
                        Broker::k8s_type(props.scope).kind,
                        props.broker_name
                    ),
                )
            })
    }

    async fn poll(&self, mut instance: ServiceInstance) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let key = instance.metadata.id().to_owned();
        let operation = instance
            .status
            .current_operation
            .unwrap_or(InstanceOperation::Provision);
        let props = match Self::polled_properties(&instance) {
            Some(props) => props,
            None => {
                instance.status.async_op_in_progress = false;
                self.instances().update_status(&instance).await?;
                return Err(ReconcileError::internal(
                    reason::ERROR_POLLING_LAST_OPERATION,
                    "an async operation is in progress but no properties were recorded for it",
                ));
            }
        };
        let broker = self.broker_for(&instance, &props).await?;
        let client = self.ctx.broker_client(&broker).await.map_err(|err| {
            ReconcileError::transient(reason::ERROR_GETTING_AUTH_CREDENTIALS, err.describe())
        })?;
        let request = LastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            service_id: Some(props.class_external_id.clone()),
            plan_id: Some(props.plan_external_id.clone()),
            operation_key: instance.status.last_operation.clone(),
            originating_identity: self.ctx.originating_identity(props.user_info.as_ref())?,
        };

        let response = match client.poll_last_operation(&request).await {
            Ok(response) => response,
            Err(err) => {
                let message = format!("Error polling last operation: {}", err.describe());
                if self.ctx.retry_timed_out(instance.status.operation_start_time, now) {
                    return self.poll_timed_out(instance, operation, now).await;
                }
                let changed = instance.status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reason::ERROR_POLLING_LAST_OPERATION,
                    &message,
                    now,
                );
                if changed {
                    instance = self.instances().update_status(&instance).await?;
                }
                self.ctx.warning(&instance, reason::ERROR_POLLING_LAST_OPERATION, message);
                return Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)));
            }
        };
        log::debug!("Instance {} last operation is {:?}", key, response.state);

        match (response.state, operation) {
            (LastOperationState::InProgress, _) => {
                if self.ctx.retry_timed_out(instance.status.operation_start_time, now) {
                    return self.poll_timed_out(instance, operation, now).await;
                }
                if let Some(description) = response.description {
                    let in_progress_reason = match operation {
                        InstanceOperation::Provision => reason::PROVISIONING,
                        InstanceOperation::Update => reason::UPDATING_INSTANCE,
                        InstanceOperation::Deprovision => reason::DEPROVISIONING,
                    };
                    let changed = instance.status.conditions.set(
                        ConditionType::Ready,
                        ConditionStatus::False,
                        in_progress_reason,
                        &description,
                        now,
                    );
                    if changed {
                        self.instances().update_status(&instance).await?;
                    }
                }
                Ok(ReconcileResult::RequeueAfter(self.next_poll(&key)))
            }
            (LastOperationState::Succeeded, InstanceOperation::Deprovision)
            | (LastOperationState::Gone, InstanceOperation::Deprovision) => {
                self.deprovision_succeeded(instance, now).await
            }
            (LastOperationState::Succeeded, _) => self.operation_succeeded(instance, None, now).await,
            (LastOperationState::Failed, _) | (LastOperationState::Gone, _) => {
                let description = match response.state {
                    LastOperationState::Gone => "the broker no longer knows the instance".to_owned(),
                    _ => response
                        .description
                        .unwrap_or_else(|| "the broker reported a failure".to_owned()),
                };
                self.async_failed(instance, operation, description, now).await
            }
        }
    }

    async fn async_failed(
        &self,
        mut instance: ServiceInstance,
        operation: InstanceOperation,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&instance.metadata.id().to_owned());
        let (failure_reason, message) = match operation {
            InstanceOperation::Provision => (
                reason::PROVISION_CALL_FAILED,
                format!("Provision call failed: {}", description),
            ),
            InstanceOperation::Update => (
                reason::UPDATE_INSTANCE_CALL_FAILED,
                format!("Update call failed: {}", description),
            ),
            InstanceOperation::Deprovision => (
                reason::DEPROVISION_CALL_FAILED,
                format!("Deprovision call failed: {}", description),
            ),
        };
        let status = &mut instance.status;
        mark_failed(status, failure_reason, &message, now);
        if operation == InstanceOperation::Deprovision {
            status.deprovision_status = DeprovisionStatus::Failed;
        }
        let instance = self.instances().update_status(&instance).await?;
        self.ctx.warning(&instance, reason::BROKER_RETURNED_FAILURE, message.clone());
        Err(ReconcileError::permanent(failure_reason, message))
    }

    /// The async operation ran past the retry duration. An unfinished provision leaves an
    /// unknown state at the broker, so it is cleaned up through orphan mitigation.
    async fn poll_timed_out(
        &self,
        mut instance: ServiceInstance,
        operation: InstanceOperation,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&instance.metadata.id().to_owned());
        let message = format!(
            "Stopped polling the {:?} operation after {:?}",
            operation, self.ctx.config.reconciliation_retry_duration
        );
        let status = &mut instance.status;
        mark_failed(status, reason::ERROR_RECONCILIATION_RETRY_TIMEOUT, &message, now);
        match operation {
            InstanceOperation::Provision => {
                status.orphan_mitigation_in_progress = true;
                status.deprovision_status = DeprovisionStatus::Required;
                status.conditions.set(
                    ConditionType::OrphanMitigation,
                    ConditionStatus::True,
                    reason::STARTING_ORPHAN_MITIGATION,
                    "The asynchronous provision timed out; attempting to deprovision the instance in order to mitigate an orphaned resource",
                    now,
                );
            }
            InstanceOperation::Deprovision => status.deprovision_status = DeprovisionStatus::Failed,
            InstanceOperation::Update => {}
        }
        let instance = self.instances().update_status(&instance).await?;
        self.ctx
            .warning(&instance, reason::ERROR_RECONCILIATION_RETRY_TIMEOUT, message.clone());
        if operation == InstanceOperation::Provision {
            Ok(ReconcileResult::RequeueWithBackoff)
        } else {
            Err(ReconcileError::permanent(reason::ERROR_RECONCILIATION_RETRY_TIMEOUT, message))
        }
    }

    async fn bindings_of(&self, instance: &ServiceInstance) -> Result<Vec<ServiceBinding>, ReconcileError> {
        let namespace = namespace_of(instance);
        let bindings: Api<ServiceBinding> = self.ctx.api(Scope::Namespaced);
        let all = bindings
            .list(&ListParams::all().in_namespace(Some(namespace.as_str())))
            .await?;
        Ok(all
            .into_iter()
            .filter(|b| b.spec.instance_ref.name == instance.metadata.name)
            .collect())
    }

    /// Deprovisions a deleting instance, or one in orphan mitigation
    async fn deprovision(&self, instance: ServiceInstance) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let orphan = instance.status.orphan_mitigation_in_progress;
        if !orphan {
            if !instance.metadata.has_finalizer(Finalizer::ServiceCatalog) {
                return Ok(ReconcileResult::Done);
            }
            match instance.status.deprovision_status {
                DeprovisionStatus::NotRequired | DeprovisionStatus::Succeeded => {
                    return self.release(instance).await
                }
                DeprovisionStatus::Failed => return Ok(ReconcileResult::Done),
                DeprovisionStatus::Required => {}
            }
            let bindings = self.bindings_of(&instance).await?;
            if !bindings.is_empty() {
                let message = format!(
                    "All associated ServiceBindings must be removed before this ServiceInstance can be deleted ({} remaining)",
                    bindings.len()
                );
                let mut blocked = instance;
                let changed = blocked.status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reason::DEPROVISION_BLOCKED_BY_CREDENTIALS,
                    &message,
                    now,
                );
                if changed {
                    let blocked = self.instances().update_status(&blocked).await?;
                    self.ctx
                        .warning(&blocked, reason::DEPROVISION_BLOCKED_BY_CREDENTIALS, message);
                }
                return Ok(ReconcileResult::Done);
            }
        }

        let props = match instance
            .status
            .external_properties
            .clone()
            .or_else(|| instance.status.in_progress_properties.clone())
        {
            Some(props) => props,
            None => return self.deprovision_succeeded(instance, now).await,
        };
        let broker = match self.broker_for(&instance, &props).await {
            Ok(broker) => broker,
            Err(err) => return self.deprovision_failed(instance, err, now).await,
        };
        let identity = self.ctx.originating_identity(instance.spec.user_info.as_ref())?;

        let mut pending = instance;
        let status = &mut pending.status;
        if !orphan && status.current_operation != Some(InstanceOperation::Deprovision) {
            status.operation_start_time = Some(now);
        }
        status.current_operation = Some(InstanceOperation::Deprovision);
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            reason::DEPROVISION_REQUEST_IN_FLIGHT,
            "Deprovision request for the instance is in flight",
            now,
        );
        let instance = self.instances().update_status(&pending).await?;

        let client = match self.ctx.broker_client(&broker).await {
            Ok(client) => client,
            Err(err) => {
                let err = ReconcileError::transient(reason::ERROR_GETTING_AUTH_CREDENTIALS, err.describe());
                return self.deprovision_failed(instance, err, now).await;
            }
        };
        let request = DeprovisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: props.class_external_id.clone(),
            plan_id: props.plan_external_id.clone(),
            originating_identity: identity,
        };
        log::info!(
            "Deprovisioning instance {}{}",
            instance.metadata.id(),
            if orphan { " for orphan mitigation" } else { "" }
        );
        match client.deprovision_instance(&request).await {
            Ok(response) if response.is_async => {
                self.begin_async(instance, response.operation_key, None, reason::DEPROVISIONING)
                    .await
            }
            Ok(_) => self.deprovision_succeeded(instance, now).await,
            Err(err) if err.is_gone() => self.deprovision_succeeded(instance, now).await,
            Err(err) => {
                let err = ReconcileError::from_osb(reason::DEPROVISION_CALL_FAILED, &err);
                self.deprovision_failed(instance, err, now).await
            }
        }
    }

    async fn deprovision_failed(
        &self,
        mut instance: ServiceInstance,
        err: ReconcileError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_stale_write() {
            return Err(err);
        }
        let status = &mut instance.status;
        if status.orphan_mitigation_in_progress {
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::ORPHAN_MITIGATION_FAILED,
                &err.message,
                now,
            );
            let instance = self.instances().update_status(&instance).await?;
            self.ctx.warning(&instance, reason::ORPHAN_MITIGATION_FAILED, err.message.clone());
            return Err(ReconcileError::transient(reason::ORPHAN_MITIGATION_FAILED, err.message));
        }

        let terminal = !err.kind.is_retryable() || self.ctx.retry_timed_out(status.operation_start_time, now);
        let err = if terminal {
            let failure_reason = if err.kind.is_retryable() {
                reason::ERROR_RECONCILIATION_RETRY_TIMEOUT
            } else {
                err.reason
            };
            mark_failed(status, failure_reason, &err.message, now);
            status.deprovision_status = DeprovisionStatus::Failed;
            ReconcileError::permanent(failure_reason, err.message)
        } else {
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                err.reason,
                &err.message,
                now,
            );
            err
        };
        let instance = self.instances().update_status(&instance).await?;
        self.ctx.warning(&instance, err.reason, err.message.clone());
        Err(err)
    }

    async fn deprovision_succeeded(
        &self,
        mut instance: ServiceInstance,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.polls.reset(&instance.metadata.id().to_owned());
        let status = &mut instance.status;
        status.current_operation = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.provision_status = ProvisionStatus::NotProvisioned;

        if status.orphan_mitigation_in_progress {
            status.orphan_mitigation_in_progress = false;
            status.deprovision_status = DeprovisionStatus::NotRequired;
            status.in_progress_properties = None;
            status.conditions.remove(ConditionType::OrphanMitigation);
            status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::ORPHAN_MITIGATION_SUCCESSFUL,
                "Orphan mitigation was completed successfully",
                now,
            );
            let instance = self.instances().update_status(&instance).await?;
            self.ctx.normal(
                &instance,
                reason::ORPHAN_MITIGATION_SUCCESSFUL,
                "Orphan mitigation was completed successfully",
            );
            if instance.metadata.is_deleting() {
                return self.release(instance).await;
            }
            return if instance.is_terminally_failed() {
                Ok(ReconcileResult::Done)
            } else {
                Ok(ReconcileResult::RequeueWithBackoff)
            };
        }

        status.deprovision_status = DeprovisionStatus::Succeeded;
        status.operation_start_time = None;
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::False,
            reason::DEPROVISIONED_SUCCESSFULLY,
            "The instance was deprovisioned successfully",
            now,
        );
        let instance = self.instances().update_status(&instance).await?;
        self.ctx.normal(
            &instance,
            reason::DEPROVISIONED_SUCCESSFULLY,
            "The instance was deprovisioned successfully",
        );
        if instance.metadata.is_deleting() {
            self.release(instance).await
        } else {
            Ok(ReconcileResult::Done)
        }
    }

    async fn release(&self, instance: ServiceInstance) -> Result<ReconcileResult, ReconcileError> {
        let key = instance.metadata.id().to_owned();
        self.polls.reset(&key);
        if instance.metadata.has_finalizer(Finalizer::ServiceCatalog) {
            log::info!("Removing {} finalizer from instance {}", Finalizer::ServiceCatalog, key);
            let patch = Patch::remove_finalizer(&instance.metadata, Finalizer::ServiceCatalog);
            self.instances().patch(&key.as_id_ref(), &patch).await?;
        }
        Ok(ReconcileResult::Done)
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    fn name(&self) -> &'static str {
        "service-instance"
    }

    fn owned_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ServiceInstance]
    }

    fn related_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ServiceBinding]
    }

    /// A deleting instance waits for its bindings, so every binding change wakes its instance
    async fn keys_for_related(&self, _k8s_type: &'static K8sType, object: &Value) -> Vec<ObjectId> {
        match serde_json::from_value::<ServiceBinding>(object.clone()) {
            Ok(binding) => vec![ObjectId::new(
                binding.metadata.namespace.unwrap_or_default(),
                binding.spec.instance_ref.name,
            )],
            Err(err) => {
                log::warn!("Ignoring undecodable binding: {}", err);
                Vec::new()
            }
        }
    }

    async fn reconcile(&self, key: &ObjectId) -> ReconcileResult {
        self.reconcile_instance(key).await.into()
    }
}
