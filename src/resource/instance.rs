use crate::k8s_types::{v1beta1, K8sType};
use crate::resource::{Conditions, ObjectMeta, Resource, Scope};

use chrono::{DateTime, Utc};
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(flatten)]
    pub plan_reference: PlanReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    #[serde(default, rename = "externalID")]
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Names a class and a plan, each by exactly one of external name, external ID, or store
/// name. The cluster and namespaced variants must not be mixed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_name: Option<String>,
    #[serde(default, rename = "clusterServiceClassExternalID", skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_name: Option<String>,
    #[serde(default, rename = "clusterServicePlanExternalID", skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,
    #[serde(default, rename = "serviceClassExternalID", skip_serializing_if = "Option::is_none")]
    pub service_class_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,
    #[serde(default, rename = "servicePlanExternalID", skip_serializing_if = "Option::is_none")]
    pub service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
}

/// One way of pointing at a catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    ExternalName(String),
    ExternalId(String),
    Name(String),
}

impl EntryRef {
    /// The field selector that finds the entry in the store
    pub fn field_selector(&self) -> String {
        match self {
            EntryRef::ExternalName(v) => format!("spec.externalName=={}", v),
            EntryRef::ExternalId(v) => format!("spec.externalID=={}", v),
            EntryRef::Name(v) => format!("name=={}", v),
        }
    }
}

impl Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryRef::ExternalName(v) => write!(f, "(ExternalName: {:?})", v),
            EntryRef::ExternalId(v) => write!(f, "(ExternalID: {:?})", v),
            EntryRef::Name(v) => write!(f, "(K8S: {:?})", v),
        }
    }
}

fn pick(
    external_name: &Option<String>,
    external_id: &Option<String>,
    name: &Option<String>,
) -> Result<Option<EntryRef>, usize> {
    let mut found = Vec::with_capacity(1);
    if let Some(v) = external_name {
        found.push(EntryRef::ExternalName(v.clone()));
    }
    if let Some(v) = external_id {
        found.push(EntryRef::ExternalId(v.clone()));
    }
    if let Some(v) = name {
        found.push(EntryRef::Name(v.clone()));
    }
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(n),
    }
}

impl PlanReference {
    pub fn cluster_class(&self) -> Result<Option<EntryRef>, usize> {
        pick(
            &self.cluster_service_class_external_name,
            &self.cluster_service_class_external_id,
            &self.cluster_service_class_name,
        )
    }

    pub fn cluster_plan(&self) -> Result<Option<EntryRef>, usize> {
        pick(
            &self.cluster_service_plan_external_name,
            &self.cluster_service_plan_external_id,
            &self.cluster_service_plan_name,
        )
    }

    pub fn namespaced_class(&self) -> Result<Option<EntryRef>, usize> {
        pick(
            &self.service_class_external_name,
            &self.service_class_external_id,
            &self.service_class_name,
        )
    }

    pub fn namespaced_plan(&self) -> Result<Option<EntryRef>, usize> {
        pick(
            &self.service_plan_external_name,
            &self.service_plan_external_id,
            &self.service_plan_name,
        )
    }

    /// The scope the reference points into. Namespaced wins only if no cluster field is set;
    /// admission rejects references that mix the two.
    pub fn scope(&self) -> Scope {
        let any_cluster = self.cluster_service_class_external_name.is_some()
            || self.cluster_service_class_external_id.is_some()
            || self.cluster_service_class_name.is_some()
            || self.cluster_service_plan_external_name.is_some()
            || self.cluster_service_plan_external_id.is_some()
            || self.cluster_service_plan_name.is_some();
        let any_namespaced = self.service_class_external_name.is_some()
            || self.service_class_external_id.is_some()
            || self.service_class_name.is_some()
            || self.service_plan_external_name.is_some()
            || self.service_plan_external_id.is_some()
            || self.service_plan_name.is_some();
        if any_namespaced && !any_cluster {
            Scope::Namespaced
        } else {
            Scope::Cluster
        }
    }

    pub fn is_mixed_scope(&self) -> bool {
        let cluster = matches!(self.cluster_class(), Ok(Some(_)) | Err(_))
            || matches!(self.cluster_plan(), Ok(Some(_)) | Err(_));
        let namespaced = matches!(self.namespaced_class(), Ok(Some(_)) | Err(_))
            || matches!(self.namespaced_plan(), Ok(Some(_)) | Err(_));
        cluster && namespaced
    }

    pub fn class_ref(&self) -> Result<Option<EntryRef>, usize> {
        match self.scope() {
            Scope::Cluster => self.cluster_class(),
            Scope::Namespaced => self.namespaced_class(),
        }
    }

    pub fn plan_ref(&self) -> Result<Option<EntryRef>, usize> {
        match self.scope() {
            Scope::Cluster => self.cluster_plan(),
            Scope::Namespaced => self.namespaced_plan(),
        }
    }

    /// Fills in the plan with its store name, in the scope of the class reference
    pub fn set_plan_name(&mut self, scope: Scope, plan_name: String) {
        match scope {
            Scope::Cluster => self.cluster_service_plan_name = Some(plan_name),
            Scope::Namespaced => self.service_plan_name = Some(plan_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Identity of the user that last changed the spec, forwarded to brokers as the originating
/// identity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceOperation {
    Provision,
    Update,
    Deprovision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionStatus {
    NotProvisioned,
    Provisioned,
}

impl Default for ProvisionStatus {
    fn default() -> ProvisionStatus {
        ProvisionStatus::NotProvisioned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeprovisionStatus {
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

impl Default for DeprovisionStatus {
    fn default() -> DeprovisionStatus {
        DeprovisionStatus::NotRequired
    }
}

/// Class and plan an instance resolved to, by store name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedReferences {
    pub scope: Scope,
    pub class_name: String,
    pub plan_name: String,
}

/// Snapshot of the properties sent to the broker, pinned for the duration of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProperties {
    pub scope: Scope,
    #[serde(default)]
    pub broker_name: String,
    pub class_name: String,
    #[serde(rename = "classExternalID")]
    pub class_external_id: String,
    pub plan_name: String,
    pub plan_external_name: String,
    #[serde(rename = "planExternalID")]
    pub plan_external_id: String,
    /// Parameters with every secret sourced value redacted
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
pub struct InstanceStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub async_op_in_progress: bool,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
    #[serde(default, rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<InstanceOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_references: Option<ResolvedReferences>,
    /// Class and plan defaults, pinned the first time the instance is sent to its broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provision_parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<InstanceProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<InstanceProperties>,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub provision_status: ProvisionStatus,
    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_version: Option<u32>,
}

impl ServiceInstance {
    pub fn new(namespace: &str, name: &str) -> ServiceInstance {
        ServiceInstance {
            metadata: ObjectMeta::new(Some(namespace), name),
            spec: InstanceSpec::default(),
            status: InstanceStatus::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .is_true(crate::resource::ConditionType::Ready)
    }

    pub fn is_failed(&self) -> bool {
        self.status
            .conditions
            .is_true(crate::resource::ConditionType::Failed)
    }

    /// Failed for the generation it was last reconciled at. Nothing is retried until the spec
    /// changes again.
    pub fn is_terminally_failed(&self) -> bool {
        self.is_failed() && self.metadata.generation == self.status.reconciled_generation
    }
}

impl Resource for ServiceInstance {
    fn k8s_type(_scope: Scope) -> &'static K8sType {
        v1beta1::ServiceInstance
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
    fn plan_reference_fields_are_flattened_into_the_spec() {
        let json = serde_json::json!({
            "metadata": {"name": "test-instance", "namespace": "test-ns"},
            "spec": {
                "clusterServiceClassExternalName": "test-serviceclass",
                "clusterServicePlanExternalName": "test-plan",
                "externalID": "abc",
            }
        });
        let instance: ServiceInstance = serde_json::from_value(json.clone()).unwrap();
        let plan_ref = &instance.spec.plan_reference;
        assert_eq!(Scope::Cluster, plan_ref.scope());
        assert_eq!(
            Ok(Some(EntryRef::ExternalName("test-serviceclass".to_owned()))),
            plan_ref.class_ref()
        );
        assert_eq!(
            Ok(Some(EntryRef::ExternalName("test-plan".to_owned()))),
            plan_ref.plan_ref()
        );
        assert_eq!("abc", instance.spec.external_id);

        let round_tripped = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["spec"], round_tripped["spec"]);
    }

    #[test]
    fn conflicting_class_specifiers_are_reported() {
        let plan_ref = PlanReference {
            cluster_service_class_external_name: Some("a".to_owned()),
            cluster_service_class_name: Some("b".to_owned()),
            ..Default::default()
        };
        assert_eq!(Err(2), plan_ref.class_ref());
        assert_eq!(Ok(None), plan_ref.plan_ref());
    }

    #[test]
    fn namespaced_references_are_detected() {
        let plan_ref = PlanReference {
            service_class_external_id: Some("SCGUID".to_owned()),
            service_plan_name: Some("p".to_owned()),
            ..Default::default()
        };
        assert_eq!(Scope::Namespaced, plan_ref.scope());
        assert!(!plan_ref.is_mixed_scope());
        assert_eq!(Ok(Some(EntryRef::Name("p".to_owned()))), plan_ref.plan_ref());

        let mixed = PlanReference {
            cluster_service_plan_name: Some("p".to_owned()),
            ..plan_ref
        };
        assert!(mixed.is_mixed_scope());
    }

    #[test]
    fn entry_refs_map_to_field_selectors() {
        assert_eq!(
            "spec.externalID==PGUID",
            EntryRef::ExternalId("PGUID".to_owned()).field_selector()
        );
        assert_eq!("name==abc", EntryRef::Name("abc".to_owned()).field_selector());
    }
}
