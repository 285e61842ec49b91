use crate::k8s_types::{v1beta1, K8sType};
use crate::resource::{
    ConditionType, Conditions, LocalObjectReference, ObjectMeta, ObjectReference,
    ParametersFromSource, Resource, Scope, UserInfo,
};

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub metadata: ObjectMeta,
    pub spec: BindingSpec,
    #[serde(default)]
    pub status: BindingStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    pub instance_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    #[serde(default)]
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transforms: Vec<SecretTransform>,
    #[serde(default, rename = "externalID")]
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Applied in order to the credentials returned by the broker before they are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretTransform {
    RenameKey { from: String, to: String },
    AddKey { key: String, value: String },
    /// Copies every entry of another secret. The secret defaults to the binding's namespace.
    AddKeysFrom {
        #[serde(rename = "secretRef")]
        secret_ref: ObjectReference,
    },
    RemoveKey { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingOperation {
    Bind,
    Unbind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnbindStatus {
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

impl Default for UnbindStatus {
    fn default() -> UnbindStatus {
        UnbindStatus::NotRequired
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub async_op_in_progress: bool,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<BindingOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<BindingProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<BindingProperties>,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub unbind_status: UnbindStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_version: Option<u32>,
}

impl ServiceBinding {
    pub fn new(namespace: &str, name: &str, instance_name: &str) -> ServiceBinding {
        ServiceBinding {
            metadata: ObjectMeta::new(Some(namespace), name),
            spec: BindingSpec {
                instance_ref: LocalObjectReference::new(instance_name),
                ..Default::default()
            },
            status: BindingStatus::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.conditions.is_true(ConditionType::Ready)
    }

    pub fn is_failed(&self) -> bool {
        self.status.conditions.is_true(ConditionType::Failed)
    }

    /// Failed for the generation it was last reconciled at
    pub fn is_terminally_failed(&self) -> bool {
        self.is_failed() && self.metadata.generation == self.status.reconciled_generation
    }

    /// The secret name, falling back to the binding name when admission has not defaulted it
    pub fn secret_name(&self) -> &str {
        if self.spec.secret_name.is_empty() {
            self.metadata.name.as_str()
        } else {
            self.spec.secret_name.as_str()
        }
    }
}

impl Resource for ServiceBinding {
    fn k8s_type(_scope: Scope) -> &'static K8sType {
        v1beta1::ServiceBinding
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
