//! Typed shapes for everything the controllers read and write. Every object carries an
//! `ObjectMeta` envelope and implements `Resource`, which is the only thing the generic
//! store `Api` needs to encode, decode and key it.
mod binding;
mod broker;
mod catalog;
pub mod condition;
pub mod finalizer;
mod instance;
mod namespace;
mod object_id;
mod secret;

pub use self::binding::*;
pub use self::broker::*;
pub use self::catalog::*;
pub use self::condition::{Condition, ConditionStatus, ConditionType, Conditions};
pub use self::finalizer::Finalizer;
pub use self::instance::*;
pub use self::namespace::Namespace;
pub use self::object_id::{ObjectId, ObjectIdRef};
pub use self::secret::*;

use crate::k8s_types::K8sType;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::Debug;

pub type JsonObject = serde_json::Map<String, Value>;

/// Catalog resources exist in a cluster-scoped and a namespaced variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Cluster,
    Namespaced,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> ObjectMeta {
        ObjectMeta {
            name: name.into(),
            namespace: namespace.map(str::to_owned),
            ..Default::default()
        }
    }

    pub fn id(&self) -> ObjectIdRef<'_> {
        ObjectIdRef::new(self.namespace.as_deref().unwrap_or(""), self.name.as_str())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: Finalizer) -> bool {
        self.finalizers.iter().any(|f| f == finalizer.as_str())
    }

    /// Returns true if the finalizer was not already present
    pub fn add_finalizer(&mut self, finalizer: Finalizer) -> bool {
        if self.has_finalizer(finalizer) {
            false
        } else {
            self.finalizers.push(finalizer.as_str().to_owned());
            true
        }
    }

    /// Returns true if the finalizer was present
    pub fn remove_finalizer(&mut self, finalizer: Finalizer) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer.as_str());
        before != self.finalizers.len()
    }

    pub fn is_owned_by(&self, owner: &OwnerReference) -> bool {
        self.owner_references
            .iter()
            .any(|r| r.kind == owner.kind && r.name == owner.name && r.uid == owner.uid)
    }

    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// A reference to an object by name, with the namespace implied by context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> LocalObjectReference {
        LocalObjectReference { name: name.into() }
    }
}

/// A reference to an object that may live in another namespace
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Implemented by every stored kind. The `Api` uses it to pick the storage kind for a scope
/// and to reach the metadata envelope without knowing anything else about the type.
pub trait Resource: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    fn k8s_type(scope: Scope) -> &'static K8sType;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn owner_reference(&self, scope: Scope) -> OwnerReference {
        let k8s_type = Self::k8s_type(scope);
        OwnerReference {
            api_version: k8s_type.api_version.to_owned(),
            kind: k8s_type.kind.to_owned(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: true,
        }
    }
}

/// Scope implied by the presence of a namespace in the metadata
pub fn scope_of(meta: &ObjectMeta) -> Scope {
    if meta.namespace.as_deref().map(str::is_empty).unwrap_or(true) {
        Scope::Cluster
    } else {
        Scope::Namespaced
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finalizers_are_added_and_removed_once() {
        let mut meta = ObjectMeta::new(Some("test-ns"), "test-instance");
        assert!(meta.add_finalizer(Finalizer::ServiceCatalog));
        assert!(!meta.add_finalizer(Finalizer::ServiceCatalog));
        assert_eq!(1, meta.finalizers.len());
        assert!(meta.has_finalizer(Finalizer::ServiceCatalog));
        assert!(!meta.has_finalizer(Finalizer::CatalogOwner));

        assert!(meta.remove_finalizer(Finalizer::ServiceCatalog));
        assert!(!meta.remove_finalizer(Finalizer::ServiceCatalog));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn scope_follows_the_namespace() {
        assert_eq!(Scope::Cluster, scope_of(&ObjectMeta::new(None, "b")));
        assert_eq!(Scope::Cluster, scope_of(&ObjectMeta::new(Some(""), "b")));
        assert_eq!(Scope::Namespaced, scope_of(&ObjectMeta::new(Some("ns"), "b")));
    }

    #[test]
    fn metadata_serializes_in_camel_case_and_skips_empty_fields() {
        let mut meta = ObjectMeta::new(Some("test-ns"), "test-binding");
        meta.resource_version = "12".to_owned();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            serde_json::json!({
                "name": "test-binding",
                "namespace": "test-ns",
                "generation": 0,
                "resourceVersion": "12",
            }),
            json
        );
    }
}
