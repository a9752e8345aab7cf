//! Transport layer: the round-trip abstraction the pipeline is built from,
//! the plain HTTP client transport, and the multi-backend fan-out.

use crate::config::TransportConfig;
use crate::errors::{BackendError, ProxyError};
use crate::metrics_defs::BACKEND_REQUEST_DURATION;
use crate::storages::Backend;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::groom_proxied_headers;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;

/// One dispatch attempt against a single backend.
pub type BackendOutcome = Result<Response<Bytes>, BackendError>;

/// Round-trip abstraction for every stage of the pipeline. Bodies are
/// buffered `Bytes`, so one request can be replayed against any number of
/// backends from byte zero.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError>;
}

/// Collapses the outcomes of a multi-backend dispatch into one response.
///
/// The handler sees every outcome; whatever quorum or short-circuit policy
/// applies lives here, never in the transport.
pub trait MultipleResponsesHandler: Send + Sync {
    fn reconcile(&self, outcomes: Vec<BackendOutcome>) -> Result<Response<Bytes>, ProxyError>;
}

/// Default reconciliation: the first success (or redirect) wins, then any
/// response regardless of status, then the first backend error.
pub struct FirstSuccessHandler;

impl MultipleResponsesHandler for FirstSuccessHandler {
    fn reconcile(&self, outcomes: Vec<BackendOutcome>) -> Result<Response<Bytes>, ProxyError> {
        let mut fallback_response = None;
        let mut first_error = None;

        for outcome in outcomes {
            match outcome {
                Ok(response)
                    if response.status().is_success() || response.status().is_redirection() =>
                {
                    return Ok(response);
                }
                Ok(response) => {
                    if fallback_response.is_none() {
                        fallback_response = Some(response);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(response) = fallback_response {
            return Ok(response);
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Err(ProxyError::NoResponses),
        }
    }
}

/// Plain HTTP transport. Expects requests that already carry an absolute
/// URI (the backend rewrite has happened), grooms headers in both
/// directions, bounds the whole exchange by the response timeout, and
/// buffers the response body.
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    response_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .build(connector);
        Self {
            client,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        groom_proxied_headers(&mut parts.headers, parts.version);
        let req = Request::from_parts(parts, Full::new(body));

        let response = timeout(self.response_timeout, self.client.request(req))
            .await
            .map_err(|_| ProxyError::ResponseTimeout)?
            .map_err(|e| ProxyError::RequestFailed(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        groom_proxied_headers(&mut parts.headers, parts.version);
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| ProxyError::ResponseBodyError(e.to_string()))?;

        Ok(Response::from_parts(parts, body))
    }
}

/// Dispatches one request to every backend in parallel and hands the full
/// outcome list to the reconciliation handler. All dispatches run to
/// completion; there is no early return at this layer.
pub struct MultiTransport {
    backends: Vec<Arc<Backend>>,
    handler: Arc<dyn MultipleResponsesHandler>,
}

impl std::fmt::Debug for MultiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTransport")
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

impl MultiTransport {
    pub fn new(backends: Vec<Arc<Backend>>, handler: Arc<dyn MultipleResponsesHandler>) -> Self {
        Self { backends, handler }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }
}

#[async_trait]
impl RoundTrip for MultiTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let mut dispatches = JoinSet::new();

        for backend in &self.backends {
            let backend = backend.clone();
            let req = clone_buffered_request(&req);
            dispatches.spawn(async move {
                let start = Instant::now();
                let outcome = backend.round_trip(req).await;
                record_dispatch(&backend, &outcome, start.elapsed());
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(self.backends.len());
        while let Some(joined) = dispatches.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "backend dispatch task panicked"),
            }
        }

        self.handler.reconcile(outcomes)
    }
}

fn record_dispatch(backend: &Backend, outcome: &BackendOutcome, elapsed: Duration) {
    let status = match outcome {
        Ok(response) => response.status().as_u16().to_string(),
        Err(_) => "error".to_string(),
    };
    metrics::histogram!(
        BACKEND_REQUEST_DURATION.name,
        "backend" => backend.name().to_string(),
        "status" => status,
    )
    .record(elapsed.as_secs_f64());
}

/// Rebuilds a buffered request so each backend gets its own copy starting
/// at byte zero. `Bytes` clones share the underlying buffer.
pub(crate) fn clone_buffered_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut clone = Request::new(req.body().clone());
    *clone.method_mut() = req.method().clone();
    *clone.uri_mut() = req.uri().clone();
    *clone.version_mut() = req.version();
    *clone.headers_mut() = req.headers().clone();
    clone
}
