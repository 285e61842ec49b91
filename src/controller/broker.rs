use crate::checksum::{canonical_json, sha256_hex};
use crate::controller::{reason, ControllerContext};
use crate::filter::{class_fields, class_restrictions, plan_fields, plan_restrictions, Selector};
use crate::handler::{ReconcileError, ReconcileResult, Reconciler};
use crate::k8s_types::{v1beta1, K8sType};
use crate::osb::{CatalogResponse, OsbError};
use crate::resource::{
    catalog_entry_name, Broker, ConditionStatus, ConditionType, Finalizer, LocalObjectReference,
    ObjectId, ObjectMeta, Resource, Scope, ServiceClass, ServiceClassSpec, ServiceInstance,
    ServicePlan, ServicePlanSpec,
};
use crate::store::{Api, ListParams, Patch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use std::collections::HashSet;
use std::time::Duration;

/// Keeps the classes and plans of each broker in line with the broker's catalog
pub struct BrokerReconciler {
    ctx: ControllerContext,
}

#[derive(Debug, PartialEq)]
enum Relist {
    Now,
    After(Duration),
    Never,
}

/// Store names of the catalog entries that instances still point at
#[derive(Debug, Default)]
struct References {
    classes: HashSet<String>,
    plans: HashSet<String>,
}

fn scope_of_key(key: &ObjectId) -> Scope {
    if key.namespace().is_some() {
        Scope::Namespaced
    } else {
        Scope::Cluster
    }
}

/// Decides whether the catalog must be fetched now. A broker is settled once it has either
/// fetched the catalog or given up for its current generation.
fn relist_decision(broker: &Broker, interval: Option<Duration>, now: DateTime<Utc>) -> Relist {
    let status = &broker.status;
    if broker.metadata.generation != status.reconciled_generation {
        return Relist::Now;
    }
    let since = if status.conditions.is_true(ConditionType::Ready) {
        status.last_catalog_retrieval_time
    } else if status.conditions.is_true(ConditionType::Failed) {
        status
            .conditions
            .get(ConditionType::Failed)
            .map(|c| c.last_transition_time)
    } else {
        None
    };
    match (since, interval) {
        (None, _) => Relist::Now,
        (Some(_), None) => Relist::Never,
        (Some(since), Some(interval)) => {
            let elapsed = (now - since).to_std().unwrap_or_default();
            if elapsed >= interval {
                Relist::Now
            } else {
                Relist::After(interval - elapsed)
            }
        }
    }
}

/// Converts the broker's catalog into classes and plans, named by their external IDs
fn catalog_entries(broker: &Broker, catalog: &CatalogResponse) -> (Vec<ServiceClass>, Vec<ServicePlan>) {
    let namespace = broker.metadata.namespace.as_deref();
    let broker_name = broker.metadata.name.as_str();
    let mut classes = Vec::with_capacity(catalog.services.len());
    let mut plans = Vec::new();

    for service in catalog.services.iter() {
        let class_name = catalog_entry_name(broker_name, &service.id);
        for plan in service.plans.iter() {
            plans.push(ServicePlan {
                metadata: ObjectMeta::new(namespace, catalog_entry_name(broker_name, &plan.id)),
                spec: ServicePlanSpec {
                    broker_name: broker_name.to_owned(),
                    external_name: plan.name.clone(),
                    external_id: plan.id.clone(),
                    description: plan.description.clone(),
                    bindable: plan.bindable,
                    free: plan.free.unwrap_or(true),
                    external_metadata: plan.metadata.clone(),
                    instance_create_parameter_schema: plan.instance_create_schema().cloned(),
                    instance_update_parameter_schema: plan.instance_update_schema().cloned(),
                    binding_create_parameter_schema: plan.binding_create_schema().cloned(),
                    service_class_ref: LocalObjectReference::new(class_name.clone()),
                    default_provision_parameters: None,
                },
                status: Default::default(),
            });
        }
        classes.push(ServiceClass {
            metadata: ObjectMeta::new(namespace, class_name),
            spec: ServiceClassSpec {
                broker_name: broker_name.to_owned(),
                external_name: service.name.clone(),
                external_id: service.id.clone(),
                description: service.description.clone(),
                bindable: service.bindable,
                binding_retrievable: service.bindings_retrievable,
                plan_updatable: service.plan_updateable,
                tags: service.tags.clone(),
                requires: service.requires.clone(),
                external_metadata: service.metadata.clone(),
                default_provision_parameters: None,
            },
            status: Default::default(),
        });
    }
    (classes, plans)
}

/// Drops everything the broker's catalog restrictions exclude. Plans of excluded classes go too.
fn apply_restrictions(
    broker: &Broker,
    classes: Vec<ServiceClass>,
    plans: Vec<ServicePlan>,
) -> Result<(Vec<ServiceClass>, Vec<ServicePlan>), ReconcileError> {
    let (class_filter, plan_filter) = match broker.spec.catalog_restrictions.as_ref() {
        Some(restrictions) => {
            let invalid = |err: crate::filter::SelectorParseError| {
                ReconcileError::user(
                    reason::ERROR_INVALID_CATALOG_RESTRICTIONS,
                    format!("invalid catalog restrictions: {}", err),
                )
            };
            (
                class_restrictions(&restrictions.service_class).map_err(invalid)?,
                plan_restrictions(&restrictions.service_plan).map_err(invalid)?,
            )
        }
        None => (Selector::everything(), Selector::everything()),
    };

    let classes: Vec<ServiceClass> = classes
        .into_iter()
        .filter(|class| class_filter.matches(&class_fields(class)))
        .collect();
    let kept: HashSet<&str> = classes.iter().map(|c| c.metadata.name.as_str()).collect();
    let plans = plans
        .into_iter()
        .filter(|plan| kept.contains(plan.spec.service_class_ref.name.as_str()))
        .filter(|plan| plan_filter.matches(&plan_fields(plan)))
        .collect();
    Ok((classes, plans))
}

fn catalog_checksum(catalog: &CatalogResponse) -> Result<String, ReconcileError> {
    let value = serde_json::to_value(catalog).map_err(|err| {
        ReconcileError::internal(reason::ERROR_SYNCING_CATALOG, format!("failed to serialize catalog: {}", err))
    })?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

/// Brokers named in the instance's pinned properties
fn brokers_of_instance(instance: &ServiceInstance) -> Vec<ObjectId> {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let status = &instance.status;
    status
        .external_properties
        .iter()
        .chain(status.in_progress_properties.iter())
        .filter(|props| !props.broker_name.is_empty())
        .map(|props| match props.scope {
            Scope::Cluster => ObjectId::cluster(props.broker_name.clone()),
            Scope::Namespaced => ObjectId::new(namespace.clone(), props.broker_name.clone()),
        })
        .collect()
}

impl BrokerReconciler {
    pub fn new(ctx: ControllerContext) -> BrokerReconciler {
        BrokerReconciler { ctx }
    }

    async fn reconcile_broker(&self, key: &ObjectId) -> Result<ReconcileResult, ReconcileError> {
        let scope = scope_of_key(key);
        let brokers: Api<Broker> = self.ctx.api(scope);
        let broker = match brokers.get(&key.as_id_ref()).await? {
            Some(broker) => broker,
            None => {
                log::debug!("Broker {} no longer exists", key);
                return Ok(ReconcileResult::Done);
            }
        };
        if broker.metadata.is_deleting() {
            return self.finalize(scope, broker).await;
        }

        let broker = if broker.metadata.has_finalizer(Finalizer::CatalogOwner) {
            broker
        } else {
            log::info!("Adding {} finalizer to broker {}", Finalizer::CatalogOwner, key);
            let patch = Patch::add_finalizer(&broker.metadata, Finalizer::CatalogOwner);
            brokers.patch(&key.as_id_ref(), &patch).await?
        };

        let now = Utc::now();
        let interval = match broker.relist_interval(self.ctx.config.default_relist_interval) {
            Ok(interval) => interval,
            Err(raw) => {
                let err = ReconcileError::user(
                    reason::ERROR_INVALID_RELIST_DURATION,
                    format!("relistDuration {:?} is not a valid duration", raw),
                );
                return self.record_failure(scope, broker, err, now).await;
            }
        };

        match relist_decision(&broker, interval, now) {
            Relist::Now => self.refresh(scope, broker, interval, now).await,
            Relist::After(remaining) => {
                log::debug!("Broker {} relists in {}s", key, remaining.as_secs());
                Ok(ReconcileResult::RequeueAfter(remaining))
            }
            Relist::Never => Ok(ReconcileResult::Done),
        }
    }

    /// Fetches the catalog and brings the classes and plans in line with it
    async fn refresh(
        &self,
        scope: Scope,
        broker: Broker,
        interval: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        let id = broker.metadata.id().to_owned();
        let client = match self.ctx.broker_client(&broker).await {
            Ok(client) => client,
            Err(err) => {
                let err = ReconcileError::transient(
                    reason::ERROR_GETTING_AUTH_CREDENTIALS,
                    format!("Error getting broker auth credentials: {}", err),
                );
                return self.record_failure(scope, broker, err, now).await;
            }
        };

        log::info!("Fetching catalog from broker {}", id);
        let catalog = match client.get_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                let err = fetch_error(&err);
                return self.record_failure(scope, broker, err, now).await;
            }
        };

        let (classes, plans) = catalog_entries(&broker, &catalog);
        let (classes, plans) = match apply_restrictions(&broker, classes, plans) {
            Ok(filtered) => filtered,
            Err(err) => return self.record_failure(scope, broker, err, now).await,
        };
        log::debug!(
            "Broker {} catalog has {} classes and {} plans after restrictions",
            id,
            classes.len(),
            plans.len()
        );
        if let Err(err) = self.sync_catalog(scope, &broker, classes, plans).await {
            let err = if err.is_stale_write() {
                err
            } else {
                ReconcileError::transient(
                    reason::ERROR_SYNCING_CATALOG,
                    format!("Error syncing catalog from broker: {}", err.message),
                )
            };
            return self.record_failure(scope, broker, err, now).await;
        }

        let mut updated = broker.clone();
        let generation = updated.metadata.generation;
        let status = &mut updated.status;
        status.conditions.set(
            ConditionType::Ready,
            ConditionStatus::True,
            reason::FETCHED_CATALOG,
            "Successfully fetched catalog entries from broker.",
            now,
        );
        status.conditions.remove(ConditionType::Failed);
        status.last_catalog_retrieval_time = Some(now);
        status.last_catalog_checksum = Some(catalog_checksum(&catalog)?);
        status.reconciled_generation = generation;
        status.observed_generation = generation;
        status.operation_start_time = None;

        let brokers: Api<Broker> = self.ctx.api(scope);
        let updated = brokers.update_status(&updated).await?;
        if !broker.status.conditions.is_true(ConditionType::Ready) {
            self.ctx.normal(
                &updated,
                reason::FETCHED_CATALOG,
                "Successfully fetched catalog entries from broker.",
            );
        }
        Ok(interval
            .map(ReconcileResult::RequeueAfter)
            .unwrap_or(ReconcileResult::Done))
    }

    /// Records a failed fetch in the broker status. Retryable failures are given up on once the
    /// reconciliation retry duration has passed.
    async fn record_failure(
        &self,
        scope: Scope,
        mut broker: Broker,
        err: ReconcileError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        if err.is_stale_write() {
            return Err(err);
        }
        let before = broker.status.clone();
        let generation = broker.metadata.generation;
        let status = &mut broker.status;
        status.observed_generation = generation;
        status
            .conditions
            .set(ConditionType::Ready, ConditionStatus::False, err.reason, &err.message, now);

        let retryable = err.kind.is_retryable();
        let timed_out = retryable && self.ctx.retry_timed_out(status.operation_start_time, now);
        let err = if timed_out || !retryable {
            let (failure_reason, message) = if timed_out {
                (
                    reason::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                    format!("Stopped retrying catalog fetch after {:?}: {}", self.ctx.config.reconciliation_retry_duration, err.message),
                )
            } else {
                (err.reason, err.message.clone())
            };
            status.conditions.set(
                ConditionType::Failed,
                ConditionStatus::True,
                failure_reason,
                &message,
                now,
            );
            status.reconciled_generation = generation;
            status.operation_start_time = None;
            ReconcileError::user(failure_reason, message)
        } else {
            if status.operation_start_time.is_none() {
                status.operation_start_time = Some(now);
            }
            err
        };

        if broker.status != before {
            let brokers: Api<Broker> = self.ctx.api(scope);
            broker = brokers.update_status(&broker).await?;
        }
        self.ctx.warning(&broker, err.reason, err.message.clone());
        Err(err)
    }

    /// Creates, updates and retires classes and plans so that they match the given entries
    async fn sync_catalog(
        &self,
        scope: Scope,
        broker: &Broker,
        classes: Vec<ServiceClass>,
        plans: Vec<ServicePlan>,
    ) -> Result<(), ReconcileError> {
        let class_api: Api<ServiceClass> = self.ctx.api(scope);
        let plan_api: Api<ServicePlan> = self.ctx.api(scope);
        let (existing_classes, existing_plans) = self.owned_entries(scope, broker).await?;

        let wanted_classes: HashSet<String> = classes.iter().map(|c| c.metadata.name.clone()).collect();
        let wanted_plans: HashSet<String> = plans.iter().map(|p| p.metadata.name.clone()).collect();

        for class in classes {
            let current = existing_classes
                .iter()
                .find(|c| c.metadata.name == class.metadata.name);
            upsert(&class_api, current, class).await?;
        }
        for plan in plans {
            let current = existing_plans
                .iter()
                .find(|p| p.metadata.name == plan.metadata.name);
            upsert(&plan_api, current, plan).await?;
        }

        for class in existing_classes
            .into_iter()
            .filter(|c| !wanted_classes.contains(&c.metadata.name))
        {
            retire(&class_api, class).await?;
        }
        for plan in existing_plans
            .into_iter()
            .filter(|p| !wanted_plans.contains(&p.metadata.name))
        {
            retire(&plan_api, plan).await?;
        }

        self.delete_unreferenced(scope, broker).await?;
        Ok(())
    }

    async fn owned_entries(
        &self,
        scope: Scope,
        broker: &Broker,
    ) -> Result<(Vec<ServiceClass>, Vec<ServicePlan>), ReconcileError> {
        let selector = Selector::parse(&format!("spec.brokerName=={}", broker.metadata.name))
            .map_err(|err| ReconcileError::internal(reason::ERROR_SYNCING_CATALOG, err.to_string()))?;
        let params = ListParams::all()
            .in_namespace(broker.metadata.namespace.as_deref())
            .fields(selector);
        let classes = self.ctx.api::<ServiceClass>(scope).list(&params).await?;
        let plans = self.ctx.api::<ServicePlan>(scope).list(&params).await?;
        Ok((classes, plans))
    }

    /// Every class and plan referenced by an instance, in the scope of the broker
    async fn references(&self, scope: Scope, broker: &Broker) -> Result<References, ReconcileError> {
        let params = match scope {
            Scope::Cluster => ListParams::all(),
            Scope::Namespaced => ListParams::all().in_namespace(broker.metadata.namespace.as_deref()),
        };
        let instances = self.ctx.api::<ServiceInstance>(Scope::Namespaced).list(&params).await?;
        let mut refs = References::default();
        for instance in instances {
            let status = instance.status;
            if let Some(resolved) = status.resolved_references.filter(|r| r.scope == scope) {
                refs.classes.insert(resolved.class_name);
                refs.plans.insert(resolved.plan_name);
            }
            for props in status
                .in_progress_properties
                .into_iter()
                .chain(status.external_properties)
                .filter(|p| p.scope == scope)
            {
                refs.classes.insert(props.class_name);
                refs.plans.insert(props.plan_name);
            }
        }
        Ok(refs)
    }

    /// Deletes retired entries that no instance points at. Returns how many entries of the
    /// broker are left afterwards.
    async fn delete_unreferenced(&self, scope: Scope, broker: &Broker) -> Result<usize, ReconcileError> {
        let (classes, plans) = self.owned_entries(scope, broker).await?;
        let refs = self.references(scope, broker).await?;
        let mut remaining = 0;

        let plan_api: Api<ServicePlan> = self.ctx.api(scope);
        for plan in plans {
            if plan.status.removed_from_broker_catalog && !refs.plans.contains(&plan.metadata.name) {
                plan_api.delete(&plan.metadata.id()).await.map_err(|err| {
                    ReconcileError::transient(reason::ERROR_DELETING_SERVICE_PLAN, err.to_string())
                })?;
            } else {
                remaining += 1;
            }
        }
        let class_api: Api<ServiceClass> = self.ctx.api(scope);
        for class in classes {
            if class.status.removed_from_broker_catalog && !refs.classes.contains(&class.metadata.name) {
                class_api.delete(&class.metadata.id()).await.map_err(|err| {
                    ReconcileError::transient(reason::ERROR_DELETING_SERVICE_CLASS, err.to_string())
                })?;
            } else {
                remaining += 1;
            }
        }
        Ok(remaining)
    }

    /// Retires every entry of a deleting broker and releases the broker once they're all gone
    async fn finalize(&self, scope: Scope, mut broker: Broker) -> Result<ReconcileResult, ReconcileError> {
        if !broker.metadata.has_finalizer(Finalizer::CatalogOwner) {
            return Ok(ReconcileResult::Done);
        }
        let (classes, plans) = self.owned_entries(scope, &broker).await?;
        let class_api: Api<ServiceClass> = self.ctx.api(scope);
        for class in classes {
            retire(&class_api, class).await?;
        }
        let plan_api: Api<ServicePlan> = self.ctx.api(scope);
        for plan in plans {
            retire(&plan_api, plan).await?;
        }

        let remaining = self.delete_unreferenced(scope, &broker).await?;
        let brokers: Api<Broker> = self.ctx.api(scope);
        if remaining > 0 {
            let message = format!(
                "Waiting for {} catalog entries that are still used by instances",
                remaining
            );
            log::info!("Broker {}: {}", broker.metadata.id(), message);
            let changed = broker.status.conditions.set(
                ConditionType::Ready,
                ConditionStatus::False,
                reason::WAITING_FOR_CATALOG_CLEANUP,
                &message,
                Utc::now(),
            );
            if changed {
                brokers.update_status(&broker).await?;
            }
            return Ok(ReconcileResult::Done);
        }

        let patch = Patch::remove_finalizer(&broker.metadata, Finalizer::CatalogOwner);
        brokers.patch(&broker.metadata.id(), &patch).await?;
        self.ctx.normal(
            &broker,
            reason::DELETED_BROKER_SUCCESSFULLY,
            "The broker was deleted successfully",
        );
        Ok(ReconcileResult::Done)
    }
}

fn fetch_error(err: &OsbError) -> ReconcileError {
    ReconcileError::transient(
        reason::ERROR_FETCHING_CATALOG,
        format!("Error getting catalog from broker: {}", err.describe()),
    )
}

/// What the catalog sync needs to know about classes and plans
trait CatalogEntry: Resource {
    type Spec: PartialEq;

    fn spec_mut(&mut self) -> &mut Self::Spec;

    fn removed_mut(&mut self) -> &mut bool;

    /// The desired spec, keeping the identity fields of the existing entry
    fn merged_spec(&self, desired: Self) -> Self::Spec;
}

impl CatalogEntry for ServiceClass {
    type Spec = ServiceClassSpec;

    fn spec_mut(&mut self) -> &mut ServiceClassSpec {
        &mut self.spec
    }

    fn removed_mut(&mut self) -> &mut bool {
        &mut self.status.removed_from_broker_catalog
    }

    fn merged_spec(&self, desired: ServiceClass) -> ServiceClassSpec {
        ServiceClassSpec {
            broker_name: self.spec.broker_name.clone(),
            external_id: self.spec.external_id.clone(),
            default_provision_parameters: self.spec.default_provision_parameters.clone(),
            ..desired.spec
        }
    }
}

impl CatalogEntry for ServicePlan {
    type Spec = ServicePlanSpec;

    fn spec_mut(&mut self) -> &mut ServicePlanSpec {
        &mut self.spec
    }

    fn removed_mut(&mut self) -> &mut bool {
        &mut self.status.removed_from_broker_catalog
    }

    fn merged_spec(&self, desired: ServicePlan) -> ServicePlanSpec {
        ServicePlanSpec {
            broker_name: self.spec.broker_name.clone(),
            external_id: self.spec.external_id.clone(),
            default_provision_parameters: self.spec.default_provision_parameters.clone(),
            ..desired.spec
        }
    }
}

/// Creates the entry, or updates the spec of the existing one. An entry that reappears in
/// the catalog is no longer considered removed.
async fn upsert<R: CatalogEntry>(api: &Api<R>, current: Option<&R>, desired: R) -> Result<(), ReconcileError> {
    let current = match current {
        Some(current) => current,
        None => {
            log::info!("Creating {} {}", api.k8s_type(), desired.metadata().id());
            api.create(&desired).await?;
            return Ok(());
        }
    };
    let mut updated = current.clone();
    let spec = current.merged_spec(desired);
    if *updated.spec_mut() != spec {
        log::info!("Updating {} {}", api.k8s_type(), current.metadata().id());
        *updated.spec_mut() = spec;
        updated = api.update(&updated).await?;
    }
    if *updated.removed_mut() {
        log::info!("{} {} is back in the catalog", api.k8s_type(), current.metadata().id());
        *updated.removed_mut() = false;
        api.update_status(&updated).await?;
    }
    Ok(())
}

async fn retire<R: CatalogEntry>(api: &Api<R>, mut entry: R) -> Result<(), ReconcileError> {
    if *entry.removed_mut() {
        return Ok(());
    }
    log::info!("{} {} was removed from the broker catalog", api.k8s_type(), entry.metadata().id());
    *entry.removed_mut() = true;
    api.update_status(&entry).await?;
    Ok(())
}

#[async_trait]
impl Reconciler for BrokerReconciler {
    fn name(&self) -> &'static str {
        "service-broker"
    }

    fn owned_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ClusterServiceBroker, v1beta1::ServiceBroker]
    }

    fn related_types(&self) -> Vec<&'static K8sType> {
        vec![v1beta1::ServiceInstance]
    }

    async fn keys_for_related(&self, _k8s_type: &'static K8sType, object: &Value) -> Vec<ObjectId> {
        match serde_json::from_value::<ServiceInstance>(object.clone()) {
            Ok(instance) => brokers_of_instance(&instance),
            Err(err) => {
                log::warn!("Ignoring undecodable instance: {}", err);
                Vec::new()
            }
        }
    }

    async fn reconcile(&self, key: &ObjectId) -> ReconcileResult {
        self.reconcile_broker(key).await.into()
    }
}
