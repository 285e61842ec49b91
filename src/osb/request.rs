use crate::osb::types::*;
use crate::osb::{AuthConfig, BrokerClientConfig, OsbError, API_VERSION_HEADER, ORIGINATING_IDENTITY_HEADER};

use http::{header, Method, Request};
use hyper::Body;
use serde::Serialize;
use url::Url;

pub fn catalog_request(config: &BrokerClientConfig) -> Result<Request<Body>, OsbError> {
    let url = make_url(config, &["v2", "catalog"], &[])?;
    build(config, Method::GET, url, None, Body::empty())
}

pub fn provision_request(
    config: &BrokerClientConfig,
    req: &ProvisionRequest,
) -> Result<Request<Body>, OsbError> {
    let url = make_url(
        config,
        &["v2", "service_instances", req.instance_id.as_str()],
        &incomplete_query(req.accepts_incomplete),
    )?;
    build(
        config,
        Method::PUT,
        url,
        req.originating_identity.as_ref(),
        json_body(req)?,
    )
}

pub fn update_request(
    config: &BrokerClientConfig,
    req: &UpdateInstanceRequest,
) -> Result<Request<Body>, OsbError> {
    let url = make_url(
        config,
        &["v2", "service_instances", req.instance_id.as_str()],
        &incomplete_query(req.accepts_incomplete),
    )?;
    build(
        config,
        Method::PATCH,
        url,
        req.originating_identity.as_ref(),
        json_body(req)?,
    )
}

pub fn deprovision_request(
    config: &BrokerClientConfig,
    req: &DeprovisionRequest,
) -> Result<Request<Body>, OsbError> {
    let mut query = incomplete_query(req.accepts_incomplete);
    query.push(("service_id", req.service_id.as_str()));
    query.push(("plan_id", req.plan_id.as_str()));
    let url = make_url(
        config,
        &["v2", "service_instances", req.instance_id.as_str()],
        &query,
    )?;
    build(
        config,
        Method::DELETE,
        url,
        req.originating_identity.as_ref(),
        Body::empty(),
    )
}

pub fn last_operation_request(
    config: &BrokerClientConfig,
    req: &LastOperationRequest,
) -> Result<Request<Body>, OsbError> {
    let query = poll_query(&req.service_id, &req.plan_id, &req.operation_key);
    let url = make_url(
        config,
        &[
            "v2",
            "service_instances",
            req.instance_id.as_str(),
            "last_operation",
        ],
        &query,
    )?;
    build(
        config,
        Method::GET,
        url,
        req.originating_identity.as_ref(),
        Body::empty(),
    )
}

pub fn binding_last_operation_request(
    config: &BrokerClientConfig,
    req: &BindingLastOperationRequest,
) -> Result<Request<Body>, OsbError> {
    let query = poll_query(&req.service_id, &req.plan_id, &req.operation_key);
    let url = make_url(
        config,
        &[
            "v2",
            "service_instances",
            req.instance_id.as_str(),
            "service_bindings",
            req.binding_id.as_str(),
            "last_operation",
        ],
        &query,
    )?;
    build(
        config,
        Method::GET,
        url,
        req.originating_identity.as_ref(),
        Body::empty(),
    )
}

pub fn bind_request(config: &BrokerClientConfig, req: &BindRequest) -> Result<Request<Body>, OsbError> {
    let url = make_url(
        config,
        &[
            "v2",
            "service_instances",
            req.instance_id.as_str(),
            "service_bindings",
            req.binding_id.as_str(),
        ],
        &incomplete_query(req.accepts_incomplete),
    )?;
    build(
        config,
        Method::PUT,
        url,
        req.originating_identity.as_ref(),
        json_body(req)?,
    )
}

pub fn get_binding_request(
    config: &BrokerClientConfig,
    req: &GetBindingRequest,
) -> Result<Request<Body>, OsbError> {
    let url = make_url(
        config,
        &[
            "v2",
            "service_instances",
            req.instance_id.as_str(),
            "service_bindings",
            req.binding_id.as_str(),
        ],
        &[],
    )?;
    build(config, Method::GET, url, None, Body::empty())
}

pub fn unbind_request(config: &BrokerClientConfig, req: &UnbindRequest) -> Result<Request<Body>, OsbError> {
    let mut query = incomplete_query(req.accepts_incomplete);
    query.push(("service_id", req.service_id.as_str()));
    query.push(("plan_id", req.plan_id.as_str()));
    let url = make_url(
        config,
        &[
            "v2",
            "service_instances",
            req.instance_id.as_str(),
            "service_bindings",
            req.binding_id.as_str(),
        ],
        &query,
    )?;
    build(
        config,
        Method::DELETE,
        url,
        req.originating_identity.as_ref(),
        Body::empty(),
    )
}

fn incomplete_query<'a>(accepts_incomplete: bool) -> Vec<(&'static str, &'a str)> {
    if accepts_incomplete {
        vec![("accepts_incomplete", "true")]
    } else {
        Vec::new()
    }
}

fn poll_query<'a>(
    service_id: &'a Option<String>,
    plan_id: &'a Option<String>,
    operation: &'a Option<String>,
) -> Vec<(&'static str, &'a str)> {
    let mut query = Vec::with_capacity(3);
    if let Some(id) = service_id.as_deref() {
        query.push(("service_id", id));
    }
    if let Some(id) = plan_id.as_deref() {
        query.push(("plan_id", id));
    }
    if let Some(op) = operation.as_deref() {
        query.push(("operation", op));
    }
    query
}

fn json_body<T: Serialize>(body: &T) -> Result<Body, OsbError> {
    serde_json::to_vec(body)
        .map(Body::from)
        .map_err(|e| OsbError::MalformedResponse(format!("failed to encode request body: {}", e)))
}

fn make_url(
    config: &BrokerClientConfig,
    segments: &[&str],
    query: &[(&str, &str)],
) -> Result<Url, OsbError> {
    let mut url = Url::parse(config.url.as_str()).map_err(|e| OsbError::Transport {
        message: format!("invalid broker url {:?}: {}", config.url, e),
        timed_out: false,
    })?;
    {
        let mut path = url.path_segments_mut().map_err(|_| OsbError::Transport {
            message: format!("broker url {:?} can not be a base", config.url),
            timed_out: false,
        })?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn build(
    config: &BrokerClientConfig,
    method: Method,
    url: Url,
    identity: Option<&OriginatingIdentity>,
    body: Body,
) -> Result<Request<Body>, OsbError> {
    let mut builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(API_VERSION_HEADER, config.api_version.as_str())
        .header(header::ACCEPT, "application/json")
        .header(header::CONTENT_TYPE, "application/json");
    match config.auth.as_ref() {
        Some(AuthConfig::Basic { username, password }) => {
            let encoded = base64::encode(format!("{}:{}", username, password));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {}", encoded));
        }
        Some(AuthConfig::Bearer { token }) => {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        None => {}
    }
    if let Some(identity) = identity {
        builder = builder.header(ORIGINATING_IDENTITY_HEADER, identity.header_value());
    }
    builder.body(body).map_err(|e| OsbError::Transport {
        message: format!("failed to build request: {}", e),
        timed_out: false,
    })
}
