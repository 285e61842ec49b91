use crate::k8s_types::{v1beta1, K8sType};
use crate::resource::{LocalObjectReference, ObjectMeta, Resource, Scope};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Longest name the store accepts for catalog entries
pub const MAX_NAME_LENGTH: usize = 63;
const NAME_HASH_LENGTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceClass {
    pub metadata: ObjectMeta,
    pub spec: ServiceClassSpec,
    #[serde(default)]
    pub status: CatalogEntryStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    pub broker_name: String,
    pub external_name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub binding_retrievable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<Value>,
    /// Set by operators, not by the broker. Merged under the parameters of new instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provision_parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub metadata: ObjectMeta,
    pub spec: ServicePlanSpec,
    #[serde(default)]
    pub status: CatalogEntryStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    pub broker_name: String,
    pub external_name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(default)]
    pub description: String,
    /// Overrides the class level `bindable` flag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub free: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_create_parameter_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_update_parameter_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_create_parameter_schema: Option<Value>,
    pub service_class_ref: LocalObjectReference,
    /// Overrides the class defaults key by key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provision_parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntryStatus {
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

impl Resource for ServiceClass {
    fn k8s_type(scope: Scope) -> &'static K8sType {
        match scope {
            Scope::Cluster => v1beta1::ClusterServiceClass,
            Scope::Namespaced => v1beta1::ServiceClass,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for ServicePlan {
    fn k8s_type(scope: Scope) -> &'static K8sType {
        match scope {
            Scope::Cluster => v1beta1::ClusterServicePlan,
            Scope::Namespaced => v1beta1::ServicePlan,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ServicePlan {
    /// Plan level override wins over the class level flag
    pub fn is_bindable(&self, class: &ServiceClass) -> bool {
        self.spec.bindable.unwrap_or(class.spec.bindable)
    }
}

/// Derives the store name of a class or plan from the owning broker's name and the broker's
/// external ID for it. The result is a readable prefix taken from the broker name followed by a
/// hash of both inputs, and always fits in `MAX_NAME_LENGTH`.
pub fn catalog_entry_name(broker_name: &str, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(broker_name.as_bytes());
    hasher.update(b"/");
    hasher.update(external_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let max_prefix = MAX_NAME_LENGTH - NAME_HASH_LENGTH - 1;
    let prefix: String = broker_name
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(max_prefix)
        .collect();
    let prefix = prefix.trim_matches('-');
    if prefix.is_empty() {
        digest[..NAME_HASH_LENGTH].to_owned()
    } else {
        format!("{}-{}", prefix, &digest[..NAME_HASH_LENGTH])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_names_are_deterministic_and_bounded() {
        let a = catalog_entry_name("test-broker", "SCGUID");
        assert_eq!(a, catalog_entry_name("test-broker", "SCGUID"));
        assert!(a.starts_with("test-broker-"));
        assert!(a.len() <= MAX_NAME_LENGTH);

        let long = catalog_entry_name(&"Very.Long_Broker".repeat(10), "SCGUID");
        assert!(long.len() <= MAX_NAME_LENGTH);
        assert!(long
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn entry_names_do_not_alias_across_brokers_or_ids() {
        let names = vec![
            catalog_entry_name("test-broker", "SCGUID"),
            catalog_entry_name("test-broker", "PGUID"),
            catalog_entry_name("other-broker", "SCGUID"),
        ];
        assert_ne!(names[0], names[1]);
        assert_ne!(names[0], names[2]);
        assert_ne!(names[1], names[2]);
    }

    #[test]
    fn plan_bindability_overrides_class() {
        let class = ServiceClass {
            metadata: ObjectMeta::new(None, "c"),
            spec: ServiceClassSpec {
                bindable: true,
                ..Default::default()
            },
            status: Default::default(),
        };
        let mut plan = ServicePlan {
            metadata: ObjectMeta::new(None, "p"),
            spec: ServicePlanSpec::default(),
            status: Default::default(),
        };
        assert!(plan.is_bindable(&class));
        plan.spec.bindable = Some(false);
        assert!(!plan.is_bindable(&class));
    }
}
