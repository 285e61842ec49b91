//! The read/write/watch surface the controllers consume. `Store` works on raw json values
//! keyed by `K8sType`, and `Api<R>` layers the per-kind codec on top, so there's exactly one
//! client regardless of how many kinds exist.
mod api;
pub mod memory;
mod patch;

pub use self::api::Api;
pub use self::memory::InMemoryStore;
pub use self::patch::Patch;

use crate::admission::AdmissionError;
use crate::filter::{Fields, Selector};
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use std::fmt::{self, Display};
use std::pin::Pin;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(String),
    /// The resource version in the write didn't match the stored one
    Conflict(String),
    Rejected(AdmissionError),
    Invalid(String),
    Serde(serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "{} not found", key),
            StoreError::AlreadyExists(key) => write!(f, "{} already exists", key),
            StoreError::Conflict(key) => write!(
                f,
                "Operation cannot be fulfilled on {}: the object has been modified",
                key
            ),
            StoreError::Rejected(e) => write!(f, "{}", e),
            StoreError::Invalid(msg) => write!(f, "invalid object: {}", msg),
            StoreError::Serde(e) => write!(f, "(De)Serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Serde(e) => Some(e),
            StoreError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> StoreError {
        StoreError::Serde(e)
    }
}

impl From<AdmissionError> for StoreError {
    fn from(e: AdmissionError) -> StoreError {
        StoreError::Rejected(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
}

impl WatchEvent {
    pub fn object(&self) -> &Value {
        match self {
            WatchEvent::Added(v) | WatchEvent::Modified(v) | WatchEvent::Deleted(v) => v,
        }
    }
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub namespace: Option<String>,
    pub field_selector: Selector,
    pub label_selector: Selector,
}

impl ListParams {
    pub fn all() -> ListParams {
        ListParams::default()
    }

    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_owned);
        self
    }

    pub fn fields(mut self, selector: Selector) -> Self {
        self.field_selector = selector;
        self
    }

    pub fn labels(mut self, selector: Selector) -> Self {
        self.label_selector = selector;
        self
    }

    pub fn matches(&self, object: &Value) -> bool {
        if let Some(ns) = self.namespace.as_deref() {
            if object.pointer("/metadata/namespace").and_then(Value::as_str) != Some(ns) {
                return false;
            }
        }
        self.field_selector.matches(&JsonFields(object))
            && self.label_selector.matches(&LabelFields(object))
    }
}

/// Resolves dotted field paths against a stored object. `name` and `namespace` are
/// shorthands for the metadata fields.
pub struct JsonFields<'a>(pub &'a Value);

impl<'a> Fields for JsonFields<'a> {
    fn field(&self, key: &str) -> Option<String> {
        let pointer = match key {
            "name" => "/metadata/name".to_owned(),
            "namespace" => "/metadata/namespace".to_owned(),
            other => format!("/{}", other.replace('.', "/")),
        };
        match self.0.pointer(&pointer)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

pub struct LabelFields<'a>(pub &'a Value);

impl<'a> Fields for LabelFields<'a> {
    fn field(&self, key: &str) -> Option<String> {
        self.0
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Strongly consistent read of a single object
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, StoreError>;

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        params: &ListParams,
    ) -> Result<Vec<Value>, StoreError>;

    async fn create(&self, k8s_type: &'static K8sType, object: Value) -> Result<Value, StoreError>;

    /// Writes everything except `status`. Bumps the generation if anything outside of
    /// `metadata` changed.
    async fn update(&self, k8s_type: &'static K8sType, object: Value) -> Result<Value, StoreError>;

    /// Writes only `status`, never touching the generation
    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        object: Value,
    ) -> Result<Value, StoreError>;

    async fn patch(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, StoreError>;

    /// Marks the object as deleting if it has finalizers, and removes it otherwise
    async fn delete(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>)
        -> Result<(), StoreError>;

    /// Delivers every change to objects of the given kind made after this call
    fn watch(&self, k8s_type: &'static K8sType) -> WatchStream;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_fields_resolve_dotted_paths() {
        let obj = json!({
            "metadata": {"name": "n", "namespace": "ns", "labels": {"app": "db"}},
            "spec": {"externalName": "pg", "free": true, "serviceClassRef": {"name": "c"}}
        });
        let fields = JsonFields(&obj);
        assert_eq!(Some("n".to_owned()), fields.field("name"));
        assert_eq!(Some("pg".to_owned()), fields.field("spec.externalName"));
        assert_eq!(Some("true".to_owned()), fields.field("spec.free"));
        assert_eq!(Some("c".to_owned()), fields.field("spec.serviceClassRef.name"));
        assert_eq!(None, fields.field("spec.missing"));

        let params = ListParams::all()
            .in_namespace(Some("ns"))
            .fields(Selector::parse("spec.externalName==pg").unwrap())
            .labels(Selector::parse("app in (db,cache)").unwrap());
        assert!(params.matches(&obj));
        assert!(!ListParams::all().in_namespace(Some("other")).matches(&obj));
    }

    #[test]
    fn watch_events_serialize_with_type_tags() {
        let event = WatchEvent::Added(json!({"metadata": {"name": "a"}}));
        let as_json = serde_json::to_value(&event).unwrap();
        assert_eq!(json!({"type": "ADDED", "object": {"metadata": {"name": "a"}}}), as_json);
    }
}
