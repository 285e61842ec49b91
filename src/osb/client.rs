use crate::osb::request;
use crate::osb::types::*;
use crate::osb::{BrokerClient, BrokerClientConfig, BrokerClientFactory, OsbError};
use crate::runner::metrics::ClientMetrics;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::de::DeserializeOwned;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Talks OSB over http(s) to a single broker
#[derive(Debug)]
pub struct HttpBrokerClient {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: BrokerClientConfig,
    metrics: Option<ClientMetrics>,
}

impl HttpBrokerClient {
    pub fn new(
        config: BrokerClientConfig,
        metrics: Option<ClientMetrics>,
    ) -> Result<HttpBrokerClient, OsbError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls()).map_err(tls_error)?;
        if let Some(pem) = config.ca_bundle.as_ref() {
            let certs = X509::stack_from_pem(pem.as_slice()).map_err(tls_error)?;
            let cert_store = ssl.cert_store_mut();
            for cert in certs {
                cert_store.add_cert(cert).map_err(tls_error)?;
            }
        }
        if config.insecure_skip_tls_verify {
            log::warn!(
                "TLS certificate verification is disabled for broker {}, connections to {} are insecure",
                config.name,
                config.url
            );
            ssl.set_verify(SslVerifyMode::NONE);
        } else {
            ssl.set_verify(SslVerifyMode::PEER);
        }

        let https = HttpsConnector::with_connector(http, ssl).map_err(tls_error)?;
        let http_client = HyperClient::builder().build(https);
        Ok(HttpBrokerClient {
            http_client,
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &BrokerClientConfig {
        &self.config
    }

    /// Sends the request and reads the whole body, all within the configured deadline
    async fn execute(
        &self,
        operation: &'static str,
        req: Request<Body>,
    ) -> Result<(StatusCode, Bytes), OsbError> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();
        log::debug!("Starting {} request to: {}", method, uri);

        let timer = self.metrics.as_ref().map(|m| m.request_started(operation));
        let call = async {
            let response = self.http_client.request(req).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, body))
        };
        let result = tokio::time::timeout(self.config.timeout, call).await;
        if let Some(timer) = timer {
            timer.observe_duration();
        }
        let duration = start_time.elapsed().as_millis();

        match result {
            Ok(Ok((status, body))) => {
                log::debug!(
                    "Finished {} request to: {}, status: {}, total_duration: {}ms",
                    method,
                    uri,
                    status.as_u16(),
                    duration
                );
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
                }
                Ok((status, body))
            }
            Ok(Err(err)) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(OsbError::Transport {
                    message: err.to_string(),
                    timed_out: err.is_timeout(),
                })
            }
            Err(_elapsed) => {
                log::error!(
                    "{} request to: {} timed out after {}ms",
                    method,
                    uri,
                    duration
                );
                Err(OsbError::Transport {
                    message: format!("no response within {:?}", self.config.timeout),
                    timed_out: true,
                })
            }
        }
    }
}

fn tls_error(err: openssl::error::ErrorStack) -> OsbError {
    OsbError::Transport {
        message: format!("failed to configure TLS: {}", err),
        timed_out: false,
    }
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, OsbError> {
    serde_json::from_slice(body.as_ref()).map_err(|e| OsbError::MalformedResponse(e.to_string()))
}

/// Brokers may answer success with an empty body
fn decode_optional(body: &Bytes) -> Result<AsyncResponseBody, OsbError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(AsyncResponseBody::default())
    } else {
        decode(body)
    }
}

fn status_error(status: StatusCode, body: &Bytes) -> OsbError {
    let parsed: ErrorBody = serde_json::from_slice(body.as_ref()).unwrap_or_default();
    OsbError::HttpStatus {
        status: status.as_u16(),
        error: parsed.error,
        description: parsed.description,
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        let req = request::catalog_request(&self.config)?;
        let (status, body) = self.execute("get_catalog", req).await?;
        match status.as_u16() {
            200 => decode(&body),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError> {
        let req = request::provision_request(&self.config, request)?;
        let (status, body) = self.execute("provision_instance", req).await?;
        match status.as_u16() {
            200 | 201 | 202 => {
                let parsed = decode_optional(&body)?;
                Ok(ProvisionResponse {
                    is_async: status.as_u16() == 202,
                    dashboard_url: parsed.dashboard_url,
                    operation_key: parsed.operation,
                })
            }
            _ => Err(status_error(status, &body)),
        }
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError> {
        let req = request::update_request(&self.config, request)?;
        let (status, body) = self.execute("update_instance", req).await?;
        match status.as_u16() {
            200 | 202 => {
                let parsed = decode_optional(&body)?;
                Ok(UpdateInstanceResponse {
                    is_async: status.as_u16() == 202,
                    dashboard_url: parsed.dashboard_url,
                    operation_key: parsed.operation,
                })
            }
            _ => Err(status_error(status, &body)),
        }
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError> {
        let req = request::deprovision_request(&self.config, request)?;
        let (status, body) = self.execute("deprovision_instance", req).await?;
        match status.as_u16() {
            200 | 410 => Ok(DeprovisionResponse::default()),
            202 => Ok(DeprovisionResponse {
                is_async: true,
                operation_key: decode_optional(&body)?.operation,
            }),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let req = request::last_operation_request(&self.config, request)?;
        let (status, body) = self.execute("poll_last_operation", req).await?;
        match status.as_u16() {
            200 => decode(&body),
            410 => Ok(LastOperationResponse::new(LastOperationState::Gone)),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let req = request::binding_last_operation_request(&self.config, request)?;
        let (status, body) = self.execute("poll_binding_last_operation", req).await?;
        match status.as_u16() {
            200 => decode(&body),
            410 => Ok(LastOperationResponse::new(LastOperationState::Gone)),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        let req = request::bind_request(&self.config, request)?;
        let (status, body) = self.execute("bind", req).await?;
        match status.as_u16() {
            200 | 201 | 202 => {
                let parsed = decode_optional(&body)?;
                Ok(BindResponse {
                    is_async: status.as_u16() == 202,
                    credentials: parsed.credentials,
                    operation_key: parsed.operation,
                })
            }
            _ => Err(status_error(status, &body)),
        }
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, OsbError> {
        let req = request::get_binding_request(&self.config, request)?;
        let (status, body) = self.execute("get_binding", req).await?;
        match status.as_u16() {
            200 => decode(&body),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        let req = request::unbind_request(&self.config, request)?;
        let (status, body) = self.execute("unbind", req).await?;
        match status.as_u16() {
            200 | 410 => Ok(UnbindResponse::default()),
            202 => Ok(UnbindResponse {
                is_async: true,
                operation_key: decode_optional(&body)?.operation,
            }),
            _ => Err(status_error(status, &body)),
        }
    }
}

/// Caches one http client per broker, and replaces it whenever the broker's connection
/// settings change
#[derive(Debug, Default)]
pub struct HttpClientFactory {
    clients: Mutex<HashMap<String, Arc<HttpBrokerClient>>>,
    metrics: Option<ClientMetrics>,
}

impl HttpClientFactory {
    pub fn new(metrics: Option<ClientMetrics>) -> HttpClientFactory {
        HttpClientFactory {
            clients: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn cached_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn forget(&self, broker_name: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(broker_name);
        }
    }
}

impl BrokerClientFactory for HttpClientFactory {
    fn client_for(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, OsbError> {
        let mut clients = self.clients.lock().map_err(|_| OsbError::Transport {
            message: "broker client cache is unavailable".to_owned(),
            timed_out: false,
        })?;
        if let Some(existing) = clients.get(&config.name) {
            if existing.config() == config {
                return Ok(existing.clone());
            }
            log::info!("connection settings for broker {} changed, replacing its client", config.name);
        }
        let client = Arc::new(HttpBrokerClient::new(config.clone(), self.metrics.clone())?);
        clients.insert(config.name.clone(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn factory_reuses_clients_until_settings_change() {
        let factory = HttpClientFactory::new(None);
        let config = BrokerClientConfig::new("test-broker", "http://example.com");
        let first = factory.client_for(&config).unwrap();
        let second = factory.client_for(&config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, factory.cached_count());

        let mut changed = config.clone();
        changed.url = "http://other.example.com".to_owned();
        let third = factory.client_for(&changed).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(1, factory.cached_count());

        factory.forget("test-broker");
        assert_eq!(0, factory.cached_count());
    }

    #[test]
    fn error_bodies_are_parsed_when_present() {
        let body = Bytes::from_static(br#"{"error": "ConcurrencyError", "description": "busy"}"#);
        let err = status_error(StatusCode::UNPROCESSABLE_ENTITY, &body);
        assert!(err.is_retryable());
        assert_eq!(Some("ConcurrencyError"), err.error_code());

        let err = status_error(StatusCode::BAD_GATEWAY, &Bytes::from_static(b"<html>"));
        assert_eq!(Some(502), err.status());
    }

    #[test]
    fn empty_success_bodies_are_accepted() {
        assert_eq!(
            AsyncResponseBody::default(),
            decode_optional(&Bytes::from_static(b"  ")).unwrap()
        );
        assert!(decode_optional(&Bytes::from_static(b"nope")).is_err());
    }
}
