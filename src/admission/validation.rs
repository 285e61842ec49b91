//! Per-kind validators. Each `*_errors` function is pure and returns every problem it finds;
//! the `validate_*` plugins wrap them for the admission chain.
use crate::admission::{AdmissionRequest, AdmissionResult, Operation};
use crate::filter;
use crate::k8s_types::v1beta1;
use crate::resource::{
    parse_duration, scope_of, Broker, ParametersFromSource, RelistBehavior, Resource, Scope,
    ServiceBinding, ServiceClass, ServiceInstance, ServicePlan, MAX_NAME_LENGTH,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref DNS_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

const MAX_DNS_SUBDOMAIN_LENGTH: usize = 253;

pub fn validate_broker(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if !(req.is_kind(v1beta1::ClusterServiceBroker) || req.is_kind(v1beta1::ServiceBroker)) {
        return AdmissionResult::Admit;
    }
    match decode_pair::<Broker>(req) {
        Ok((new, old)) => to_result(broker_errors(&new, old.as_ref())),
        Err(reject) => reject,
    }
}

pub fn validate_class(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if !(req.is_kind(v1beta1::ClusterServiceClass) || req.is_kind(v1beta1::ServiceClass)) {
        return AdmissionResult::Admit;
    }
    match decode_pair::<ServiceClass>(req) {
        Ok((new, old)) => to_result(class_errors(&new, old.as_ref())),
        Err(reject) => reject,
    }
}

pub fn validate_plan(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if !(req.is_kind(v1beta1::ClusterServicePlan) || req.is_kind(v1beta1::ServicePlan)) {
        return AdmissionResult::Admit;
    }
    match decode_pair::<ServicePlan>(req) {
        Ok((new, old)) => to_result(plan_errors(&new, old.as_ref())),
        Err(reject) => reject,
    }
}

pub fn validate_instance(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if !req.is_kind(v1beta1::ServiceInstance) {
        return AdmissionResult::Admit;
    }
    match decode_pair::<ServiceInstance>(req) {
        Ok((new, old)) => to_result(instance_errors(&new, old.as_ref())),
        Err(reject) => reject,
    }
}

pub fn validate_binding(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if !req.is_kind(v1beta1::ServiceBinding) {
        return AdmissionResult::Admit;
    }
    match decode_pair::<ServiceBinding>(req) {
        Ok((new, old)) => to_result(binding_errors(&new, old.as_ref())),
        Err(reject) => reject,
    }
}

fn decode_pair<R: Resource>(req: &AdmissionRequest<'_>) -> Result<(R, Option<R>), AdmissionResult> {
    let new = req.decode::<R>()?;
    let old = match req.operation {
        Operation::Create => None,
        Operation::Update => req.decode_old::<R>()?,
    };
    Ok((new, old))
}

fn to_result(errors: Vec<String>) -> AdmissionResult {
    if errors.is_empty() {
        AdmissionResult::Admit
    } else {
        AdmissionResult::Reject(errors.join("; "))
    }
}

fn validate_name(name: &str, max_len: usize, errors: &mut Vec<String>) {
    if name.is_empty() {
        errors.push("metadata.name: Required value".to_owned());
    } else if name.len() > max_len {
        errors.push(format!(
            "metadata.name: must be no more than {} characters",
            max_len
        ));
    } else if !DNS_SUBDOMAIN.is_match(name) {
        errors.push(format!(
            "metadata.name: {:?} must consist of lower case alphanumeric characters, '-' or '.'",
            name
        ));
    }
}

fn validate_parameters(
    parameters: Option<&Value>,
    parameters_from: &[ParametersFromSource],
    errors: &mut Vec<String>,
) {
    if let Some(params) = parameters {
        if !params.is_object() {
            errors.push("spec.parameters: must be an object".to_owned());
        }
    }
    for (i, source) in parameters_from.iter().enumerate() {
        match source.secret_key_ref.as_ref() {
            None => errors.push(format!(
                "spec.parametersFrom[{}]: secretKeyRef is required",
                i
            )),
            Some(key_ref) => {
                if key_ref.name.is_empty() {
                    errors.push(format!(
                        "spec.parametersFrom[{}].secretKeyRef.name: Required value",
                        i
                    ));
                }
                if key_ref.key.is_empty() {
                    errors.push(format!(
                        "spec.parametersFrom[{}].secretKeyRef.key: Required value",
                        i
                    ));
                }
            }
        }
    }
}

pub fn broker_errors(broker: &Broker, old: Option<&Broker>) -> Vec<String> {
    let mut errors = Vec::new();
    validate_name(&broker.metadata.name, MAX_DNS_SUBDOMAIN_LENGTH, &mut errors);
    let spec = &broker.spec;

    match url::Url::parse(&spec.url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(format!(
            "spec.url: scheme {:?} is not supported, must be http or https",
            url.scheme()
        )),
        Err(e) => errors.push(format!("spec.url: {:?} is not a valid URL: {}", spec.url, e)),
    }

    if let Some(auth) = spec.auth_info.as_ref() {
        let configs: Vec<(&str, _)> = vec![("basic", &auth.basic), ("bearer", &auth.bearer)]
            .into_iter()
            .filter_map(|(name, config)| config.as_ref().map(|c| (name, c)))
            .collect();
        if configs.len() != 1 {
            errors.push(
                "spec.authInfo: exactly one of basic or bearer must be specified".to_owned(),
            );
        }
        for (name, config) in configs {
            let secret_ref = &config.secret_ref;
            if secret_ref.name.is_empty() {
                errors.push(format!("spec.authInfo.{}.secretRef.name: Required value", name));
            }
            let secret_ns = secret_ref.namespace.as_deref().unwrap_or("");
            match scope_of(&broker.metadata) {
                Scope::Cluster if secret_ns.is_empty() => errors.push(format!(
                    "spec.authInfo.{}.secretRef.namespace: Required value",
                    name
                )),
                Scope::Namespaced
                    if !secret_ns.is_empty()
                        && Some(secret_ns) != broker.metadata.namespace.as_deref() =>
                {
                    errors.push(format!(
                        "spec.authInfo.{}.secretRef.namespace: must be the namespace of the broker",
                        name
                    ))
                }
                _ => {}
            }
        }
    }

    if let Some(ca_bundle) = spec.ca_bundle.as_deref() {
        if spec.insecure_skip_tls_verify {
            errors.push(
                "spec.caBundle: caBundle can not be used when insecureSkipTLSVerify is true"
                    .to_owned(),
            );
        }
        if base64::decode(ca_bundle).is_err() {
            errors.push("spec.caBundle: must be base64 encoded".to_owned());
        }
    }

    match (spec.relist_behavior, spec.relist_duration.as_deref()) {
        (RelistBehavior::Manual, Some(_)) => errors.push(
            "spec.relistDuration: relistDuration must not be set when relistBehavior is Manual"
                .to_owned(),
        ),
        (RelistBehavior::Duration, Some(raw)) => match parse_duration(raw) {
            Some(d) if d.as_millis() > 0 => {}
            Some(_) => {
                errors.push("spec.relistDuration: must be greater than zero".to_owned())
            }
            None => errors.push(format!(
                "spec.relistDuration: {:?} is not a valid duration",
                raw
            )),
        },
        _ => {}
    }

    if spec.relist_requests < 0 {
        errors.push("spec.relistRequests: must be greater than or equal to 0".to_owned());
    }
    if let Some(old) = old {
        if spec.relist_requests < old.spec.relist_requests {
            errors.push(
                "spec.relistRequests: new value must be greater than or equal to the old value"
                    .to_owned(),
            );
        }
    }

    if let Some(restrictions) = spec.catalog_restrictions.as_ref() {
        if let Err(e) = filter::class_restrictions(&restrictions.service_class) {
            errors.push(format!("spec.catalogRestrictions.serviceClass: {}", e));
        }
        if let Err(e) = filter::plan_restrictions(&restrictions.service_plan) {
            errors.push(format!("spec.catalogRestrictions.servicePlan: {}", e));
        }
    }
    errors
}

pub fn class_errors(class: &ServiceClass, old: Option<&ServiceClass>) -> Vec<String> {
    let mut errors = Vec::new();
    validate_name(&class.metadata.name, MAX_NAME_LENGTH, &mut errors);
    let spec = &class.spec;
    if spec.broker_name.is_empty() {
        errors.push("spec.brokerName: Required value".to_owned());
    }
    if spec.external_name.is_empty() {
        errors.push("spec.externalName: Required value".to_owned());
    }
    if spec.external_id.is_empty() {
        errors.push("spec.externalID: Required value".to_owned());
    }
    if let Some(old) = old {
        if old.spec.external_id != spec.external_id {
            errors.push("spec.externalID: field is immutable".to_owned());
        }
        if old.spec.broker_name != spec.broker_name {
            errors.push("spec.brokerName: field is immutable".to_owned());
        }
    }
    errors
}

pub fn plan_errors(plan: &ServicePlan, old: Option<&ServicePlan>) -> Vec<String> {
    let mut errors = Vec::new();
    validate_name(&plan.metadata.name, MAX_NAME_LENGTH, &mut errors);
    let spec = &plan.spec;
    if spec.broker_name.is_empty() {
        errors.push("spec.brokerName: Required value".to_owned());
    }
    if spec.external_name.is_empty() {
        errors.push("spec.externalName: Required value".to_owned());
    }
    if spec.external_id.is_empty() {
        errors.push("spec.externalID: Required value".to_owned());
    }
    if spec.service_class_ref.name.is_empty() {
        errors.push("spec.serviceClassRef.name: Required value".to_owned());
    }
    if let Some(old) = old {
        if old.spec.external_id != spec.external_id {
            errors.push("spec.externalID: field is immutable".to_owned());
        }
        if old.spec.broker_name != spec.broker_name {
            errors.push("spec.brokerName: field is immutable".to_owned());
        }
        if old.spec.service_class_ref != spec.service_class_ref {
            errors.push("spec.serviceClassRef: field is immutable".to_owned());
        }
    }
    errors
}

pub fn instance_errors(instance: &ServiceInstance, old: Option<&ServiceInstance>) -> Vec<String> {
    let mut errors = Vec::new();
    validate_name(&instance.metadata.name, MAX_NAME_LENGTH, &mut errors);
    let spec = &instance.spec;
    let plan_ref = &spec.plan_reference;

    if plan_ref.is_mixed_scope() {
        errors.push(
            "spec: cluster and namespaced class and plan references can not be combined"
                .to_owned(),
        );
    } else {
        match plan_ref.class_ref() {
            Ok(Some(_)) => {}
            Ok(None) => errors.push("spec: a service class must be specified".to_owned()),
            Err(n) => errors.push(format!(
                "spec: exactly one service class specifier must be set, found {}",
                n
            )),
        }
        match plan_ref.plan_ref() {
            Ok(Some(_)) => {}
            Ok(None) => errors.push("spec: a service plan must be specified".to_owned()),
            Err(n) => errors.push(format!(
                "spec: exactly one service plan specifier must be set, found {}",
                n
            )),
        }
    }
    validate_parameters(spec.parameters.as_ref(), &spec.parameters_from, &mut errors);

    if let Some(old) = old {
        if !old.spec.external_id.is_empty() && old.spec.external_id != spec.external_id {
            errors.push("spec.externalID: field is immutable".to_owned());
        }
        if old.spec.plan_reference.class_ref() != plan_ref.class_ref() {
            errors.push("spec: the service class reference is immutable".to_owned());
        }
    } else if spec.external_id.is_empty() {
        errors.push("spec.externalID: Required value".to_owned());
    }
    errors
}

pub fn binding_errors(binding: &ServiceBinding, old: Option<&ServiceBinding>) -> Vec<String> {
    let mut errors = Vec::new();
    validate_name(&binding.metadata.name, MAX_DNS_SUBDOMAIN_LENGTH, &mut errors);
    let spec = &binding.spec;
    if spec.instance_ref.name.is_empty() {
        errors.push("spec.instanceRef.name: Required value".to_owned());
    }
    if !spec.secret_name.is_empty() && !DNS_SUBDOMAIN.is_match(&spec.secret_name) {
        errors.push(format!(
            "spec.secretName: {:?} is not a valid secret name",
            spec.secret_name
        ));
    }
    validate_parameters(spec.parameters.as_ref(), &spec.parameters_from, &mut errors);

    if let Some(old) = old {
        if old.spec.instance_ref != spec.instance_ref {
            errors.push("spec.instanceRef: field is immutable".to_owned());
        }
        if !old.spec.external_id.is_empty() && old.spec.external_id != spec.external_id {
            errors.push("spec.externalID: field is immutable".to_owned());
        }
    } else if spec.external_id.is_empty() {
        errors.push("spec.externalID: Required value".to_owned());
    }
    errors
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{
        BrokerAuthInfo, CatalogRestrictions, LocalObjectReference, ObjectMeta, ObjectReference,
        PlanReference, SecretAuthConfig, SecretKeyReference,
    };

    fn broker() -> Broker {
        Broker::new(None, "test-broker", "http://example.com")
    }

    fn basic_auth(namespace: Option<&str>) -> Option<BrokerAuthInfo> {
        Some(BrokerAuthInfo {
            basic: Some(SecretAuthConfig {
                secret_ref: ObjectReference {
                    namespace: namespace.map(str::to_owned),
                    name: "auth-secret".to_owned(),
                },
            }),
            bearer: None,
        })
    }

    fn instance() -> ServiceInstance {
        let mut instance = ServiceInstance::new("test-ns", "test-instance");
        instance.spec.external_id = "INSTANCE-GUID".to_owned();
        instance.spec.plan_reference = PlanReference {
            cluster_service_class_external_name: Some("test-serviceclass".to_owned()),
            cluster_service_plan_external_name: Some("test-plan".to_owned()),
            ..Default::default()
        };
        instance
    }

    #[test]
    fn valid_broker_passes() {
        assert!(broker_errors(&broker(), None).is_empty());
    }

    #[test]
    fn broker_url_must_be_http() {
        let mut b = broker();
        b.spec.url = "ftp://example.com".to_owned();
        assert_eq!(1, broker_errors(&b, None).len());
        b.spec.url = "not a url".to_owned();
        assert_eq!(1, broker_errors(&b, None).len());
    }

    #[test]
    fn cluster_broker_auth_secret_needs_a_namespace() {
        let mut b = broker();
        b.spec.auth_info = basic_auth(None);
        let errors = broker_errors(&b, None);
        assert_eq!(1, errors.len());
        assert!(errors[0].contains("namespace"), "{:?}", errors);

        b.spec.auth_info = basic_auth(Some("test-ns"));
        assert!(broker_errors(&b, None).is_empty());
    }

    #[test]
    fn auth_needs_exactly_one_scheme() {
        let mut b = broker();
        let mut auth = basic_auth(Some("test-ns")).unwrap();
        auth.bearer = auth.basic.clone();
        b.spec.auth_info = Some(auth);
        assert!(!broker_errors(&b, None).is_empty());
        b.spec.auth_info = Some(BrokerAuthInfo::default());
        assert!(!broker_errors(&b, None).is_empty());
    }

    #[test]
    fn ca_bundle_and_insecure_are_exclusive() {
        let mut b = broker();
        b.spec.ca_bundle = Some(base64::encode("-----BEGIN CERTIFICATE-----"));
        assert!(broker_errors(&b, None).is_empty());
        b.spec.insecure_skip_tls_verify = true;
        assert_eq!(1, broker_errors(&b, None).len());
    }

    #[test]
    fn relist_settings_are_checked() {
        let mut b = broker();
        b.spec.relist_duration = Some("15m".to_owned());
        assert!(broker_errors(&b, None).is_empty());
        b.spec.relist_duration = Some("fifteen minutes".to_owned());
        assert_eq!(1, broker_errors(&b, None).len());
        b.spec.relist_duration = Some("6000000000000000h".to_owned());
        assert_eq!(1, broker_errors(&b, None).len());

        b.spec.relist_behavior = RelistBehavior::Manual;
        b.spec.relist_duration = Some("15m".to_owned());
        assert_eq!(1, broker_errors(&b, None).len());
        b.spec.relist_duration = None;
        b.spec.relist_requests = -1;
        assert_eq!(1, broker_errors(&b, None).len());
    }

    #[test]
    fn relist_requests_must_not_decrease() {
        let mut old = broker();
        old.spec.relist_behavior = RelistBehavior::Manual;
        old.spec.relist_requests = 2;
        let mut new = old.clone();
        new.spec.relist_requests = 1;
        assert_eq!(1, broker_errors(&new, Some(&old)).len());
        new.spec.relist_requests = 2;
        assert!(broker_errors(&new, Some(&old)).is_empty());
        new.spec.relist_requests = 3;
        assert!(broker_errors(&new, Some(&old)).is_empty());
    }

    #[test]
    fn malformed_restrictions_are_rejected() {
        let mut b = broker();
        b.spec.catalog_restrictions = Some(CatalogRestrictions {
            service_class: vec!["externalName in (a,b)".to_owned()],
            service_plan: vec!["free==true".to_owned()],
        });
        let errors = broker_errors(&b, None);
        assert_eq!(1, errors.len(), "{:?}", errors);
        assert!(errors[0].starts_with("spec.catalogRestrictions.servicePlan"));

        b.spec.catalog_restrictions = Some(CatalogRestrictions {
            service_class: vec!["name in (a,b".to_owned()],
            service_plan: vec![],
        });
        assert_eq!(1, broker_errors(&b, None).len());
    }

    #[test]
    fn catalog_identity_is_immutable() {
        let class = ServiceClass {
            metadata: ObjectMeta::new(None, "test-broker-abc"),
            spec: crate::resource::ServiceClassSpec {
                broker_name: "test-broker".to_owned(),
                external_name: "test-serviceclass".to_owned(),
                external_id: "SCGUID".to_owned(),
                ..Default::default()
            },
            status: Default::default(),
        };
        assert!(class_errors(&class, None).is_empty());
        let mut changed = class.clone();
        changed.spec.external_id = "OTHER".to_owned();
        assert_eq!(1, class_errors(&changed, Some(&class)).len());

        let plan = ServicePlan {
            metadata: ObjectMeta::new(None, "test-broker-def"),
            spec: crate::resource::ServicePlanSpec {
                broker_name: "test-broker".to_owned(),
                external_name: "test-plan".to_owned(),
                external_id: "PGUID".to_owned(),
                service_class_ref: LocalObjectReference::new("test-broker-abc"),
                ..Default::default()
            },
            status: Default::default(),
        };
        assert!(plan_errors(&plan, None).is_empty());
        let mut moved = plan.clone();
        moved.spec.service_class_ref = LocalObjectReference::new("elsewhere");
        assert_eq!(1, plan_errors(&moved, Some(&plan)).len());
    }

    #[test]
    fn instance_plan_reference_rules() {
        assert!(instance_errors(&instance(), None).is_empty());

        let mut two_classes = instance();
        two_classes.spec.plan_reference.cluster_service_class_name = Some("x".to_owned());
        assert_eq!(1, instance_errors(&two_classes, None).len());

        let mut mixed = instance();
        mixed.spec.plan_reference.service_plan_name = Some("p".to_owned());
        assert_eq!(1, instance_errors(&mixed, None).len());

        let mut no_plan = instance();
        no_plan.spec.plan_reference.cluster_service_plan_external_name = None;
        assert_eq!(1, instance_errors(&no_plan, None).len());
    }

    #[test]
    fn instance_updates_keep_identity() {
        let old = instance();
        let mut new = old.clone();
        new.spec.plan_reference.cluster_service_plan_external_name = Some("bigger".to_owned());
        assert!(instance_errors(&new, Some(&old)).is_empty());

        new.spec.external_id = "CHANGED".to_owned();
        assert_eq!(1, instance_errors(&new, Some(&old)).len());
    }

    #[test]
    fn parameters_from_entries_need_name_and_key() {
        let mut i = instance();
        i.spec.parameters_from.push(ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: "".to_owned(),
                key: "".to_owned(),
            }),
        });
        i.spec.parameters = Some(serde_json::json!(["not", "an", "object"]));
        assert_eq!(3, instance_errors(&i, None).len());
    }

    #[test]
    fn binding_instance_ref_is_immutable() {
        let mut old = ServiceBinding::new("test-ns", "test-binding", "test-instance");
        old.spec.external_id = "BINDING-GUID".to_owned();
        assert!(binding_errors(&old, None).is_empty());
        let mut new = old.clone();
        new.spec.instance_ref = LocalObjectReference::new("other-instance");
        let errors = binding_errors(&new, Some(&old));
        assert_eq!(vec!["spec.instanceRef: field is immutable".to_owned()], errors);
    }

    #[test]
    fn names_must_be_dns_labels() {
        let mut b = broker();
        b.metadata.name = "Test_Broker".to_owned();
        assert_eq!(1, broker_errors(&b, None).len());
    }
}
