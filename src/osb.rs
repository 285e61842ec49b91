//! Client side of the Open Service Broker API. `BrokerClient` is the seam the reconcilers call
//! through; `HttpBrokerClient` speaks the wire protocol, and tests substitute a scripted fake.
mod client;
mod request;
pub mod types;

pub use self::client::{HttpBrokerClient, HttpClientFactory};
pub use self::types::*;

use async_trait::async_trait;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_API_VERSION: &str = "2.13";
pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";
pub const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

/// OSB error codes that a broker may put in the `error` field of a response body
pub const ERROR_ASYNC_REQUIRED: &str = "AsyncRequired";
pub const ERROR_CONCURRENCY: &str = "ConcurrencyError";

#[derive(Debug, Clone, PartialEq)]
pub enum OsbError {
    /// The broker answered with a status this operation doesn't expect
    HttpStatus {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },
    /// The request never produced a response, including deadline expiry
    Transport { message: String, timed_out: bool },
    MalformedResponse(String),
    AuthConfigMissing(String),
}

impl OsbError {
    pub fn status(&self) -> Option<u16> {
        match self {
            OsbError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OsbError::Transport { timed_out: true, .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, OsbError::Transport { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            OsbError::HttpStatus { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    /// 5xx, transport failures, and a broker reporting a concurrent operation are worth retrying.
    /// Every other 4xx is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            OsbError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
                    || self.error_code() == Some(ERROR_CONCURRENCY)
            }
            OsbError::Transport { .. } => true,
            OsbError::MalformedResponse(_) | OsbError::AuthConfigMissing(_) => false,
        }
    }

    /// The broker may or may not have acted on the request
    pub fn is_ambiguous(&self) -> bool {
        match self {
            OsbError::HttpStatus { status, .. } => *status >= 500,
            OsbError::Transport { timed_out, .. } => *timed_out,
            OsbError::MalformedResponse(_) => true,
            OsbError::AuthConfigMissing(_) => false,
        }
    }

    /// A short, human readable description suitable for condition messages
    pub fn describe(&self) -> String {
        match self {
            OsbError::HttpStatus {
                status,
                error,
                description,
            } => format!(
                "Status: {}; ErrorMessage: {}; Description: {}",
                status,
                error.as_deref().unwrap_or("<nil>"),
                description.as_deref().unwrap_or("<nil>")
            ),
            other => other.to_string(),
        }
    }
}

impl Display for OsbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OsbError::HttpStatus { .. } => write!(f, "unexpected broker response: {}", self.describe()),
            OsbError::Transport { message, timed_out } => {
                if *timed_out {
                    write!(f, "request to broker timed out: {}", message)
                } else {
                    write!(f, "error communicating with broker: {}", message)
                }
            }
            OsbError::MalformedResponse(msg) => write!(f, "malformed broker response: {}", msg),
            OsbError::AuthConfigMissing(msg) => write!(f, "broker auth config unavailable: {}", msg),
        }
    }
}

impl std::error::Error for OsbError {}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthConfig::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
        }
    }
}

/// Everything needed to talk to one broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerClientConfig {
    /// Cache key for the client, `[namespace/]name` of the broker resource
    pub name: String,
    pub url: String,
    pub api_version: String,
    pub auth: Option<AuthConfig>,
    pub insecure_skip_tls_verify: bool,
    /// PEM encoded CA certificates
    pub ca_bundle: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl BrokerClientConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> BrokerClientConfig {
        BrokerClientConfig {
            name: name.into(),
            url: url.into(),
            api_version: DEFAULT_API_VERSION.to_owned(),
            auth: None,
            insecure_skip_tls_verify: false,
            ca_bundle: None,
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError>;

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError>;

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError>;

    /// A 410 from the broker is reported as a synchronous success
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError>;

    /// A 410 from the broker is reported as `LastOperationState::Gone`
    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError>;

    async fn get_binding(&self, request: &GetBindingRequest)
        -> Result<GetBindingResponse, OsbError>;

    /// A 410 from the broker is reported as a synchronous success
    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError>;
}

/// Hands out clients for brokers. Implementations may cache clients, as long as a change in
/// the config produces a client for the new config.
pub trait BrokerClientFactory: Send + Sync {
    fn client_for(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, OsbError>;
}
