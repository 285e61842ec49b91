use crate::resource::{Finalizer, ObjectMeta};

use serde_json::Value;

/// A json merge patch. When the patch carries `metadata.resourceVersion` the store uses it as
/// an optimistic concurrency precondition.
#[derive(Debug, PartialEq, Clone)]
pub struct Patch {
    value: Value,
}

impl Patch {
    pub fn merge(value: Value) -> Patch {
        Patch { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Merges the patch into `target` following RFC 7386
    pub fn apply_to(&self, target: &mut Value) {
        json_patch::merge(target, &self.value);
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.value
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn add_finalizer(meta: &ObjectMeta, finalizer: Finalizer) -> Patch {
        let mut finalizers = meta.finalizers.clone();
        if !meta.has_finalizer(finalizer) {
            finalizers.push(finalizer.as_str().to_owned());
        }
        Patch::finalizers(meta, finalizers)
    }

    pub fn remove_finalizer(meta: &ObjectMeta, finalizer: Finalizer) -> Patch {
        let finalizers = meta
            .finalizers
            .iter()
            .filter(|f| f.as_str() != finalizer.as_str())
            .cloned()
            .collect();
        Patch::finalizers(meta, finalizers)
    }

    fn finalizers(meta: &ObjectMeta, finalizers: Vec<String>) -> Patch {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": meta.resource_version,
                "finalizers": finalizers,
            }
        });
        Patch { value: patch }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_follows_rfc_7386() {
        let mut target = json!({
            "a": "b",
            "c": {"d": "e", "f": "g"},
            "list": [1, 2],
        });
        let patch = json!({
            "a": "z",
            "c": {"f": null, "h": 1},
            "list": [3],
        });
        Patch::merge(patch).apply_to(&mut target);
        assert_eq!(
            json!({"a": "z", "c": {"d": "e", "h": 1}, "list": [3]}),
            target
        );
    }

    #[test]
    fn finalizer_patches_carry_the_resource_version() {
        let mut meta = ObjectMeta::new(None, "test-broker");
        meta.resource_version = "7".to_owned();
        meta.finalizers = vec!["example.com/other".to_owned()];

        let add = Patch::add_finalizer(&meta, Finalizer::CatalogOwner);
        assert_eq!(Some("7"), add.resource_version());
        assert_eq!(
            json!(["example.com/other", "servicecatalog.k8s.io/catalog-owner"]),
            add.value()["metadata"]["finalizers"]
        );

        meta.finalizers.push(Finalizer::CatalogOwner.as_str().to_owned());
        let remove = Patch::remove_finalizer(&meta, Finalizer::CatalogOwner);
        assert_eq!(
            json!(["example.com/other"]),
            remove.value()["metadata"]["finalizers"]
        );
    }
}
