use crate::admission::{AdmissionRequest, AdmissionResult, Operation};
use crate::k8s_types::v1beta1;
use crate::resource::{EntryRef, Scope, ServiceClass, ServiceInstance, ServicePlan};

/// Read access to the catalog, injected into the default plan plugin
pub trait PlanLookup: Send + Sync {
    /// Classes matching the reference. `namespace` is ignored for `Scope::Cluster`.
    fn find_classes(&self, scope: Scope, namespace: &str, class: &EntryRef) -> Vec<ServiceClass>;

    fn plans_for_class(&self, scope: Scope, namespace: &str, class_name: &str) -> Vec<ServicePlan>;
}

/// Fills in the plan of an instance that names only a class, provided the class has exactly
/// one plan. Anything else is rejected so that every admitted instance has a plan reference.
pub fn default_plan(lookup: &dyn PlanLookup, req: &AdmissionRequest<'_>) -> AdmissionResult {
    if req.operation != Operation::Create || !req.is_kind(v1beta1::ServiceInstance) {
        return AdmissionResult::Admit;
    }
    let mut instance = match req.decode::<ServiceInstance>() {
        Ok(i) => i,
        Err(reject) => return reject,
    };
    let plan_ref = &instance.spec.plan_reference;
    // malformed references are left to the instance validator
    if !matches!(plan_ref.plan_ref(), Ok(None)) || plan_ref.is_mixed_scope() {
        return AdmissionResult::Admit;
    }
    let class_ref = match plan_ref.class_ref() {
        Ok(Some(class_ref)) => class_ref,
        _ => return AdmissionResult::Admit,
    };
    let scope = plan_ref.scope();
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();

    let mut classes = lookup.find_classes(scope, &namespace, &class_ref);
    let class = match classes.len() {
        0 => {
            return AdmissionResult::Reject(format!(
                "no {} found for {}, and a plan is required when the class does not exist",
                kind_name(scope, "ServiceClass"),
                class_ref
            ))
        }
        1 => classes.remove(0),
        n => {
            return AdmissionResult::Reject(format!(
                "{} {} matched {} classes",
                kind_name(scope, "ServiceClass"),
                class_ref,
                n
            ))
        }
    };

    let mut plans: Vec<ServicePlan> = lookup
        .plans_for_class(scope, &namespace, &class.metadata.name)
        .into_iter()
        .filter(|p| !p.status.removed_from_broker_catalog)
        .collect();
    if plans.len() != 1 {
        return AdmissionResult::Reject(format!(
            "{} {:?} has {} plans, a plan must be specified",
            kind_name(scope, "ServiceClass"),
            class.spec.external_name,
            plans.len()
        ));
    }
    let plan = plans.remove(0);
    log::debug!(
        "defaulting plan of instance {} to {:?}",
        instance.metadata.id(),
        plan.spec.external_name
    );
    instance
        .spec
        .plan_reference
        .set_plan_name(scope, plan.metadata.name);
    AdmissionResult::mutated(&instance)
}

fn kind_name(scope: Scope, kind: &str) -> String {
    match scope {
        Scope::Cluster => format!("Cluster{}", kind),
        Scope::Namespaced => kind.to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{LocalObjectReference, ObjectMeta, PlanReference};

    struct FixedCatalog {
        classes: Vec<ServiceClass>,
        plans: Vec<ServicePlan>,
    }

    impl PlanLookup for FixedCatalog {
        fn find_classes(&self, _: Scope, _: &str, class: &EntryRef) -> Vec<ServiceClass> {
            self.classes
                .iter()
                .filter(|c| match class {
                    EntryRef::ExternalName(n) => c.spec.external_name == *n,
                    EntryRef::ExternalId(id) => c.spec.external_id == *id,
                    EntryRef::Name(n) => c.metadata.name == *n,
                })
                .cloned()
                .collect()
        }

        fn plans_for_class(&self, _: Scope, _: &str, class_name: &str) -> Vec<ServicePlan> {
            self.plans
                .iter()
                .filter(|p| p.spec.service_class_ref.name == class_name)
                .cloned()
                .collect()
        }
    }

    fn class() -> ServiceClass {
        let mut class = ServiceClass {
            metadata: ObjectMeta::new(None, "class-k8s-name"),
            spec: Default::default(),
            status: Default::default(),
        };
        class.spec.external_name = "test-serviceclass".to_owned();
        class.spec.external_id = "SCGUID".to_owned();
        class
    }

    fn plan(name: &str) -> ServicePlan {
        let mut plan = ServicePlan {
            metadata: ObjectMeta::new(None, name),
            spec: Default::default(),
            status: Default::default(),
        };
        plan.spec.external_name = name.to_owned();
        plan.spec.service_class_ref = LocalObjectReference::new("class-k8s-name");
        plan
    }

    fn admit(catalog: &FixedCatalog, plan_reference: PlanReference) -> AdmissionResult {
        let mut instance = ServiceInstance::new("test-ns", "test-instance");
        instance.spec.plan_reference = plan_reference;
        let value = serde_json::to_value(&instance).unwrap();
        let req = AdmissionRequest {
            k8s_type: v1beta1::ServiceInstance,
            operation: Operation::Create,
            object: &value,
            old_object: None,
        };
        default_plan(catalog, &req)
    }

    fn class_only() -> PlanReference {
        PlanReference {
            cluster_service_class_external_name: Some("test-serviceclass".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn the_only_plan_is_filled_in() {
        let catalog = FixedCatalog {
            classes: vec![class()],
            plans: vec![plan("test-plan")],
        };
        match admit(&catalog, class_only()) {
            AdmissionResult::Mutate(value) => {
                let instance: ServiceInstance = serde_json::from_value(value).unwrap();
                assert_eq!(
                    Some("test-plan".to_owned()),
                    instance.spec.plan_reference.cluster_service_plan_name
                );
            }
            other => panic!("expected mutation, got {:?}", other),
        }
    }

    #[test]
    fn multiple_plans_are_rejected() {
        let catalog = FixedCatalog {
            classes: vec![class()],
            plans: vec![plan("small"), plan("large")],
        };
        assert!(matches!(
            admit(&catalog, class_only()),
            AdmissionResult::Reject(_)
        ));
    }

    #[test]
    fn removed_plans_do_not_count() {
        let mut removed = plan("old");
        removed.status.removed_from_broker_catalog = true;
        let catalog = FixedCatalog {
            classes: vec![class()],
            plans: vec![removed, plan("current")],
        };
        assert!(matches!(
            admit(&catalog, class_only()),
            AdmissionResult::Mutate(_)
        ));
    }

    #[test]
    fn missing_class_is_rejected() {
        let catalog = FixedCatalog {
            classes: vec![],
            plans: vec![],
        };
        assert!(matches!(
            admit(&catalog, class_only()),
            AdmissionResult::Reject(_)
        ));
    }

    #[test]
    fn explicit_plans_are_left_alone() {
        let catalog = FixedCatalog {
            classes: vec![],
            plans: vec![],
        };
        let plan_ref = PlanReference {
            cluster_service_plan_external_name: Some("no-such-plan".to_owned()),
            ..class_only()
        };
        assert_eq!(AdmissionResult::Admit, admit(&catalog, plan_ref));
    }
}
