//! Request and response shapes of the OSB API. Fields that travel in the URL rather than the
//! body are marked `#[serde(skip)]`.
use crate::resource::UserInfo;

use serde_json::{Map, Value};

pub const PLATFORM_KUBERNETES: &str = "kubernetes";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub bindings_retrievable: bool,
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Schemas>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<ServiceInstanceSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<ServiceBindingSchema>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceInstanceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<InputParameters>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceBindingSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParameters>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Plan {
    pub fn instance_create_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_instance
            .as_ref()?
            .create
            .as_ref()?
            .parameters
            .as_ref()
    }

    pub fn instance_update_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_instance
            .as_ref()?
            .update
            .as_ref()?
            .parameters
            .as_ref()
    }

    pub fn binding_create_schema(&self) -> Option<&Value> {
        self.schemas
            .as_ref()?
            .service_binding
            .as_ref()?
            .create
            .as_ref()?
            .parameters
            .as_ref()
    }
}

/// Sent in the `X-Broker-API-Originating-Identity` header as `<platform> <base64 json>`
#[derive(Debug, Clone, PartialEq)]
pub struct OriginatingIdentity {
    pub platform: String,
    pub value: String,
}

impl OriginatingIdentity {
    pub fn from_user_info(user: &UserInfo) -> Result<OriginatingIdentity, serde_json::Error> {
        let value = serde_json::to_string(&serde_json::json!({
            "username": user.username,
            "uid": user.uid,
            "groups": user.groups,
            "extra": user.extra,
        }))?;
        Ok(OriginatingIdentity {
            platform: PLATFORM_KUBERNETES.to_owned(),
            value,
        })
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.platform, base64::encode(self.value.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    pub platform: String,
    pub namespace: String,
    pub clusterid: String,
}

impl RequestContext {
    pub fn kubernetes(namespace: &str, cluster_id: &str) -> RequestContext {
        RequestContext {
            platform: PLATFORM_KUBERNETES.to_owned(),
            namespace: namespace.to_owned(),
            clusterid: cluster_id.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    pub context: RequestContext,
    #[serde(skip)]
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviousValues {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInstanceRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<PreviousValues>,
    pub context: RequestContext,
    #[serde(skip)]
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateInstanceResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    /// Not a wire value; the broker answered 410
    #[serde(skip)]
    Gone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LastOperationResponse {
    pub fn new(state: LastOperationState) -> LastOperationResponse {
        LastOperationResponse {
            state,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindRequest {
    #[serde(skip)]
    pub binding_id: String,
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<Value>,
    pub context: RequestContext,
    #[serde(skip)]
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindResponse {
    pub is_async: bool,
    pub credentials: Option<Map<String, Value>>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetBindingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnbindResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

/// Body of 2xx responses to provision, update, deprovision, bind and unbind. Every field is
/// optional since brokers commonly answer with `{}`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub(crate) struct AsyncResponseBody {
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub credentials: Option<Map<String, Value>>,
}

/// Body of non-2xx responses
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
