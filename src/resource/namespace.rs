use crate::k8s_types::{core, K8sType};
use crate::resource::{ObjectMeta, Resource, Scope};

/// Only the metadata of a namespace is ever read. Its uid is sent to brokers as the space guid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub metadata: ObjectMeta,
}

impl Namespace {
    pub fn new(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta::new(None, name),
        }
    }
}

impl Resource for Namespace {
    fn k8s_type(_scope: Scope) -> &'static K8sType {
        core::v1::Namespace
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
