//! Admission is a list of plugins run in order on every create and update before the store
//! persists anything. A plugin may admit the object unchanged, replace it with a mutated copy
//! that later plugins then see, or reject the write outright.
mod default_plan;
pub mod validation;

pub use self::default_plan::{default_plan, PlanLookup};

use crate::k8s_types::{v1beta1, K8sType};
use crate::resource::{Finalizer, Resource, ServiceBinding, ServiceInstance};

use serde_json::Value;

use std::fmt::{self, Display};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
}

#[derive(Debug)]
pub struct AdmissionRequest<'a> {
    pub k8s_type: &'static K8sType,
    pub operation: Operation,
    pub object: &'a Value,
    pub old_object: Option<&'a Value>,
}

impl<'a> AdmissionRequest<'a> {
    pub fn is_kind(&self, k8s_type: &K8sType) -> bool {
        self.k8s_type == k8s_type
    }

    /// Decodes the incoming object, returning a rejection if it doesn't fit the typed shape
    pub fn decode<R: Resource>(&self) -> Result<R, AdmissionResult> {
        serde_json::from_value(self.object.clone())
            .map_err(|e| AdmissionResult::Reject(format!("malformed {}: {}", self.k8s_type.kind, e)))
    }

    pub fn decode_old<R: Resource>(&self) -> Result<Option<R>, AdmissionResult> {
        match self.old_object {
            Some(old) => serde_json::from_value(old.clone()).map(Some).map_err(|e| {
                AdmissionResult::Reject(format!("malformed stored {}: {}", self.k8s_type.kind, e))
            }),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionResult {
    Admit,
    Mutate(Value),
    Reject(String),
}

impl AdmissionResult {
    fn mutated<R: Resource>(resource: &R) -> AdmissionResult {
        match serde_json::to_value(resource) {
            Ok(value) => AdmissionResult::Mutate(value),
            Err(e) => AdmissionResult::Reject(format!("failed to encode mutated object: {}", e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionError {
    pub plugin: &'static str,
    pub message: String,
}

impl Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "admission plugin {:?} denied the request: {}", self.plugin, self.message)
    }
}

impl std::error::Error for AdmissionError {}

pub type PluginFn = Box<dyn Fn(&AdmissionRequest<'_>) -> AdmissionResult + Send + Sync>;

#[derive(Default)]
pub struct Admission {
    plugins: Vec<(&'static str, PluginFn)>,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = self.plugins.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Admission").field("plugins", &names).finish()
    }
}

impl Admission {
    /// An empty chain that admits everything
    pub fn empty() -> Admission {
        Admission::default()
    }

    /// The full chain: mutating plugins first, then the validators, which see the final object
    pub fn standard(plans: Arc<dyn PlanLookup>) -> Admission {
        Admission::empty()
            .with_plugin("ServiceBindingsDefaultSecretName", default_secret_name)
            .with_plugin("DefaultExternalID", default_external_id)
            .with_plugin("CatalogFinalizer", add_catalog_finalizer)
            .with_plugin("DefaultServicePlan", move |req| default_plan(plans.as_ref(), req))
            .with_plugin("ValidateBroker", validation::validate_broker)
            .with_plugin("ValidateServiceClass", validation::validate_class)
            .with_plugin("ValidateServicePlan", validation::validate_plan)
            .with_plugin("ValidateServiceInstance", validation::validate_instance)
            .with_plugin("ValidateServiceBinding", validation::validate_binding)
    }

    pub fn with_plugin<F>(mut self, name: &'static str, plugin: F) -> Admission
    where
        F: Fn(&AdmissionRequest<'_>) -> AdmissionResult + Send + Sync + 'static,
    {
        self.plugins.push((name, Box::new(plugin)));
        self
    }

    pub fn admit(
        &self,
        k8s_type: &'static K8sType,
        operation: Operation,
        object: Value,
        old_object: Option<&Value>,
    ) -> Result<Value, AdmissionError> {
        let mut current = object;
        for (name, plugin) in self.plugins.iter() {
            let request = AdmissionRequest {
                k8s_type,
                operation,
                object: &current,
                old_object,
            };
            match plugin(&request) {
                AdmissionResult::Admit => {}
                AdmissionResult::Mutate(mutated) => {
                    log::trace!("admission plugin {} mutated {}", name, k8s_type);
                    current = mutated;
                }
                AdmissionResult::Reject(message) => {
                    log::debug!("admission plugin {} rejected {}: {}", name, k8s_type, message);
                    return Err(AdmissionError {
                        plugin: name,
                        message,
                    });
                }
            }
        }
        Ok(current)
    }
}

/// Generates the external ID of new instances and bindings
pub fn default_external_id(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if req.operation != Operation::Create {
        return AdmissionResult::Admit;
    }
    if req.is_kind(v1beta1::ServiceInstance) {
        let mut instance = match req.decode::<ServiceInstance>() {
            Ok(i) => i,
            Err(reject) => return reject,
        };
        if !instance.spec.external_id.is_empty() {
            return AdmissionResult::Admit;
        }
        instance.spec.external_id = uuid::Uuid::new_v4().to_string();
        AdmissionResult::mutated(&instance)
    } else if req.is_kind(v1beta1::ServiceBinding) {
        let mut binding = match req.decode::<ServiceBinding>() {
            Ok(b) => b,
            Err(reject) => return reject,
        };
        if !binding.spec.external_id.is_empty() {
            return AdmissionResult::Admit;
        }
        binding.spec.external_id = uuid::Uuid::new_v4().to_string();
        AdmissionResult::mutated(&binding)
    } else {
        AdmissionResult::Admit
    }
}

pub fn default_secret_name(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if req.operation != Operation::Create || !req.is_kind(v1beta1::ServiceBinding) {
        return AdmissionResult::Admit;
    }
    let mut binding = match req.decode::<ServiceBinding>() {
        Ok(b) => b,
        Err(reject) => return reject,
    };
    if !binding.spec.secret_name.is_empty() {
        return AdmissionResult::Admit;
    }
    binding.spec.secret_name = binding.metadata.name.clone();
    AdmissionResult::mutated(&binding)
}

/// Attaches the service catalog finalizer to new instances and bindings, so that deletion
/// waits for deprovision and unbind
pub fn add_catalog_finalizer(req: &AdmissionRequest<'_>) -> AdmissionResult {
    if req.operation != Operation::Create {
        return AdmissionResult::Admit;
    }
    if req.is_kind(v1beta1::ServiceInstance) {
        let mut instance = match req.decode::<ServiceInstance>() {
            Ok(i) => i,
            Err(reject) => return reject,
        };
        if instance.metadata.add_finalizer(Finalizer::ServiceCatalog) {
            AdmissionResult::mutated(&instance)
        } else {
            AdmissionResult::Admit
        }
    } else if req.is_kind(v1beta1::ServiceBinding) {
        let mut binding = match req.decode::<ServiceBinding>() {
            Ok(b) => b,
            Err(reject) => return reject,
        };
        if binding.metadata.add_finalizer(Finalizer::ServiceCatalog) {
            AdmissionResult::mutated(&binding)
        } else {
            AdmissionResult::Admit
        }
    } else {
        AdmissionResult::Admit
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugins_run_in_order_and_see_earlier_mutations() {
        let admission = Admission::empty()
            .with_plugin("first", |_req: &AdmissionRequest<'_>| {
                AdmissionResult::Mutate(json!({"step": 1}))
            })
            .with_plugin("second", |req: &AdmissionRequest<'_>| {
                if req.object["step"] == json!(1) {
                    AdmissionResult::Mutate(json!({"step": 2}))
                } else {
                    AdmissionResult::Reject("first plugin did not run".to_owned())
                }
            });
        let result = admission
            .admit(v1beta1::ServiceInstance, Operation::Create, json!({}), None)
            .unwrap();
        assert_eq!(json!({"step": 2}), result);
    }

    #[test]
    fn rejection_stops_the_chain() {
        let admission = Admission::empty()
            .with_plugin("deny", |_req: &AdmissionRequest<'_>| {
                AdmissionResult::Reject("nope".to_owned())
            })
            .with_plugin("never", |_req: &AdmissionRequest<'_>| {
                AdmissionResult::Mutate(json!({"reached": true}))
            });
        let err = admission
            .admit(v1beta1::ServiceBinding, Operation::Update, json!({}), None)
            .unwrap_err();
        assert_eq!("deny", err.plugin);
        assert_eq!("nope", err.message);
    }

    #[test]
    fn new_bindings_get_defaults_and_a_finalizer() {
        let binding = ServiceBinding::new("test-ns", "test-binding", "test-instance");
        let admission = Admission::empty()
            .with_plugin("secret", default_secret_name)
            .with_plugin("id", default_external_id)
            .with_plugin("finalizer", add_catalog_finalizer);
        let admitted = admission
            .admit(
                v1beta1::ServiceBinding,
                Operation::Create,
                serde_json::to_value(&binding).unwrap(),
                None,
            )
            .unwrap();
        let admitted: ServiceBinding = serde_json::from_value(admitted).unwrap();
        assert_eq!("test-binding", admitted.spec.secret_name);
        assert_eq!(36, admitted.spec.external_id.len());
        assert!(admitted.metadata.has_finalizer(Finalizer::ServiceCatalog));
    }

    #[test]
    fn existing_external_ids_are_kept() {
        let mut instance = ServiceInstance::new("test-ns", "test-instance");
        instance.spec.external_id = "INSTANCE-GUID".to_owned();
        let value = serde_json::to_value(&instance).unwrap();
        let request = AdmissionRequest {
            k8s_type: v1beta1::ServiceInstance,
            operation: Operation::Create,
            object: &value,
            old_object: None,
        };
        assert_eq!(AdmissionResult::Admit, default_external_id(&request));
    }
}
