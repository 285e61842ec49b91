use crate::k8s_types::{core, K8sType};
use crate::resource::{ObjectMeta, Resource, Scope};

use std::collections::BTreeMap;

/// Credentials are stored base64 encoded under `data`, the way the orchestrator stores them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
}

impl Secret {
    pub fn new(namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta::new(Some(namespace), name),
            data: BTreeMap::new(),
            secret_type: Some("Opaque".to_owned()),
        }
    }

    pub fn with_entry(mut self, key: &str, value: &[u8]) -> Secret {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: &[u8]) {
        self.data.insert(key.to_owned(), base64::encode(value));
    }

    /// Returns `None` if the key is missing, and `Some(Err)` if the stored value isn't valid base64
    pub fn get_decoded(&self, key: &str) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.data.get(key).map(base64::decode)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_decoded(key)
            .and_then(Result::ok)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

impl Resource for Secret {
    fn k8s_type(_scope: Scope) -> &'static K8sType {
        core::v1::Secret
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn values_are_stored_base64_encoded() {
        let secret = Secret::new("test-ns", "auth").with_entry("username", b"admin");
        assert_eq!(Some(&"YWRtaW4=".to_owned()), secret.data.get("username"));
        assert_eq!(Some("admin".to_owned()), secret.get_string("username"));
        assert!(secret.get_string("password").is_none());
    }
}
