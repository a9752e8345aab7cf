//! Request/response middleware composed around the ring. A decorator wraps
//! a transport and returns a transport; the first decorator in the list
//! ends up outermost.

use crate::errors::ProxyError;
use crate::metrics_defs::REQUEST_DURATION;
use crate::storages::rehome_s3_host;
use crate::transport::RoundTrip;
use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Scheme, Uri};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub type Decorator = Box<dyn FnOnce(Arc<dyn RoundTrip>) -> Arc<dyn RoundTrip>>;

/// Wraps `transport` with `decorators`; the first listed ends up outermost.
pub fn decorate(transport: Arc<dyn RoundTrip>, decorators: Vec<Decorator>) -> Arc<dyn RoundTrip> {
    let mut transport = transport;
    for decorator in decorators.into_iter().rev() {
        transport = decorator(transport);
    }
    transport
}

/// Emits one structured record per request: method, URI, status (503 when
/// the inner call produced no response), duration in seconds, and the
/// error if any. Never alters the request or the response.
struct AccessLog {
    inner: Arc<dyn RoundTrip>,
}

pub fn access_log() -> Decorator {
    Box::new(|inner| Arc::new(AccessLog { inner }))
}

#[async_trait]
impl RoundTrip for AccessLog {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let start = Instant::now();

        let result = self.inner.round_trip(req).await;

        let duration = start.elapsed().as_secs_f64();
        let status = match &result {
            Ok(response) => response.status().as_u16(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        };
        let error = match &result {
            Ok(_) => String::new(),
            Err(e) => e.to_string(),
        };

        metrics::histogram!(REQUEST_DURATION.name, "status" => status.to_string())
            .record(duration);
        tracing::info!(
            method = %method,
            url = %uri,
            status,
            duration,
            error = %error,
            "access"
        );

        result
    }
}

/// Supplies static headers: request headers are set only when the client
/// did not send them, response headers only when the backend did not.
/// Forces the `http` scheme on authority-bearing URIs (TLS terminates in
/// front of the proxy) and keeps the bucket prefix of virtual-hosted S3
/// hosts attached to the URI authority.
struct HeadersSupplier {
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
    inner: Arc<dyn RoundTrip>,
}

pub fn headers_supplier(
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
) -> Decorator {
    Box::new(move |inner| {
        Arc::new(HeadersSupplier {
            request_headers,
            response_headers,
            inner,
        })
    })
}

#[async_trait]
impl RoundTrip for HeadersSupplier {
    async fn round_trip(&self, mut req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        force_http_scheme(&mut req)?;

        for (name, value) in &self.request_headers {
            set_if_absent(req.headers_mut(), name, value);
        }

        let rehomed = req.uri().authority().map(|a| a.to_string()).and_then(|authority| {
            let host = req.headers().get(HOST).and_then(|h| h.to_str().ok())?;
            rehome_s3_host(host, &authority)
        });
        if let Some(rehomed) = rehomed
            && let Ok(value) = HeaderValue::from_str(&rehomed)
        {
            req.headers_mut().insert(HOST, value);
        }

        let mut response = self.inner.round_trip(req).await?;

        for (name, value) in &self.response_headers {
            set_if_absent(response.headers_mut(), name, value);
        }
        Ok(response)
    }
}

fn set_if_absent(headers: &mut HeaderMap, name: &str, value: &str) {
    let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) else {
        tracing::warn!(name, value, "skipping unparsable configured header");
        return;
    };
    if !headers.contains_key(&name) {
        headers.insert(name, value);
    }
}

fn force_http_scheme(req: &mut Request<Bytes>) -> Result<(), ProxyError> {
    if req.uri().authority().is_none() {
        // Origin-form target; the backend rewrite sets the scheme later.
        return Ok(());
    }
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    *req.uri_mut() = Uri::from_parts(parts)?;
    Ok(())
}

/// Backends that do not implement CORS preflight still answer HEAD, so
/// OPTIONS is dispatched as HEAD and the response advertises an empty
/// body.
struct OptionsHandler {
    inner: Arc<dyn RoundTrip>,
}

pub fn options_handler() -> Decorator {
    Box::new(|inner| Arc::new(OptionsHandler { inner }))
}

#[async_trait]
impl RoundTrip for OptionsHandler {
    async fn round_trip(&self, mut req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let was_options = req.method() == Method::OPTIONS;
        if was_options {
            *req.method_mut() = Method::HEAD;
        }

        let mut response = self.inner.round_trip(req).await?;

        if was_options {
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        Ok(response)
    }
}
