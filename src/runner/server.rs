use crate::runner::metrics::Metrics;

use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) async fn start(
    port: u16,
    metrics: Metrics,
    running: Arc<AtomicBool>,
    serve_metrics: bool,
    serve_health: bool,
) {
    let address: SocketAddr = ([0u8; 4], port).into();
    log::info!(
        "Starting server on address: {}, exposing '/metrics': {}, '/health': {}",
        address,
        serve_metrics,
        serve_health
    );

    let svc = Svc {
        metrics,
        running: running.clone(),
        serve_metrics,
        serve_health,
    };
    let service = make_service_fn(move |_| {
        let service = svc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                futures_util::future::ready(service.handle_request(request))
            }))
        }
    });
    let shutdown = async move {
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    };
    let server = match Server::try_bind(&address) {
        Ok(builder) => builder.serve(service).with_graceful_shutdown(shutdown),
        Err(err) => {
            log::error!("Failed to bind server to {}: {}", address, err);
            return;
        }
    };
    if let Err(err) = server.await {
        log::error!("Server failed with error: {:?}", err);
    }
}

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct Svc {
    metrics: Metrics,
    running: Arc<AtomicBool>,
    serve_metrics: bool,
    serve_health: bool,
}

impl Svc {
    fn not_found(&self) -> Result<Response<Body>, Error> {
        let resp = Response::builder().status(404).body(Body::empty())?;
        Ok(resp)
    }

    fn health(&self) -> Result<Response<Body>, Error> {
        let status = if self.running.load(Ordering::Relaxed) {
            200
        } else {
            503
        };
        let resp = Response::builder().status(status).body(Body::empty())?;
        Ok(resp)
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let body = self.metrics.encode_as_text()?;
        let resp = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Body::from(body))?;
        Ok(resp)
    }

    pub(crate) fn handle_request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let req_path = request.uri().path().trim_end_matches('/');
        let req_method = request.method();

        log::debug!("Got http request {} {}", req_method, request.uri());

        let result = match (req_method, req_path) {
            (&Method::GET, "/health") if self.serve_health => self.health(),
            (&Method::GET, "/metrics") if self.serve_metrics => self.metrics(),
            _ => self.not_found(),
        };
        match result.as_ref() {
            Ok(resp) => {
                log::debug!(
                    "Finished handling {} {} with response status: {}",
                    req_method,
                    request.uri(),
                    resp.status()
                );
            }
            Err(err) => {
                log::error!(
                    "Error handling {} {} , error: {:?}",
                    req_method,
                    request.uri(),
                    err
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn svc(serve_metrics: bool) -> Svc {
        Svc {
            metrics: Metrics::new().unwrap(),
            running: Arc::new(AtomicBool::new(true)),
            serve_metrics,
            serve_health: true,
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn routes_health_and_metrics() {
        let svc = svc(true);
        assert_eq!(200, svc.handle_request(get("/health")).unwrap().status());
        let metrics = svc.handle_request(get("/metrics/")).unwrap();
        assert_eq!(200, metrics.status());
        assert_eq!(
            prometheus::TEXT_FORMAT,
            metrics.headers()[http::header::CONTENT_TYPE]
        );
        assert_eq!(404, svc.handle_request(get("/other")).unwrap().status());
    }

    #[test]
    fn disabled_endpoints_are_not_found() {
        let svc = svc(false);
        assert_eq!(404, svc.handle_request(get("/metrics")).unwrap().status());
        svc.running.store(false, Ordering::Relaxed);
        assert_eq!(503, svc.handle_request(get("/health")).unwrap().status());
    }
}
