//! Storage backends: a named endpoint plus the request rewrite that points
//! an inbound request at it.

use crate::errors::{BackendError, ProxyError};
use crate::transport::RoundTrip;
use http::header::{HOST, HeaderValue};
use http::uri::Uri;
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::sync::Arc;
use url::Url;

/// A single storage endpoint. Immutable after construction.
pub struct Backend {
    name: String,
    endpoint: Url,
    #[allow(dead_code)]
    kind: String,
    transport: Arc<dyn RoundTrip>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(
        endpoint: Url,
        kind: impl Into<String>,
        transport: Arc<dyn RoundTrip>,
    ) -> Result<Self, ProxyError> {
        let name =
            authority_of(&endpoint).ok_or_else(|| ProxyError::InvalidEndpoint(endpoint.to_string()))?;
        Ok(Self {
            name,
            endpoint,
            kind: kind.into(),
            transport,
        })
    }

    /// Authority (`host[:port]`) this backend answers on.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Rewrites the request to target this backend and dispatches it. Any
    /// failure comes back as a [`BackendError`] naming this endpoint.
    pub async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, BackendError> {
        let req = self
            .rewrite_to_backend(req)
            .map_err(|e| BackendError::new(self.name.clone(), e))?;
        self.transport
            .round_trip(req)
            .await
            .map_err(|e| BackendError::new(self.name.clone(), e))
    }

    /// Scheme, host, and port come from the endpoint; path and query are
    /// preserved. A virtual-hosted S3 Host keeps its bucket prefix so
    /// request signing stays valid against the new authority.
    fn rewrite_to_backend(&self, mut req: Request<Bytes>) -> Result<Request<Bytes>, ProxyError> {
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target: Uri =
            format!("{}://{}{}", self.endpoint.scheme(), self.name, path_and_query).parse()?;
        *req.uri_mut() = target;

        if let Some(original) = original_host
            && let Some(rehomed) = rehome_s3_host(&original, &self.name)
            && let Ok(value) = HeaderValue::from_str(&rehomed)
        {
            req.headers_mut().insert(HOST, value);
        }

        Ok(req)
    }
}

/// `bucket.s3.region.example` keeps its bucket prefix: the rewritten Host
/// is the prefix recombined with the backend authority. Hosts without the
/// virtual-hosted marker are left alone.
pub(crate) fn rehome_s3_host(original_host: &str, backend_authority: &str) -> Option<String> {
    let (bucket, _) = original_host.split_once(".s3.")?;
    Some(format!("{bucket}.{backend_authority}"))
}

fn authority_of(endpoint: &Url) -> Option<String> {
    let host = endpoint.host_str()?;
    Some(match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every dispatched request and answers 200 with the request
    /// URI as the body.
    #[derive(Default)]
    pub(crate) struct UriEchoTransport {
        calls: Mutex<Vec<(String, Option<String>, Bytes)>>,
    }

    impl UriEchoTransport {
        pub(crate) fn seen(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(uri, _, _)| uri.clone()).collect()
        }

        pub(crate) fn hosts(&self) -> Vec<Option<String>> {
            self.calls.lock().iter().map(|(_, host, _)| host.clone()).collect()
        }

        pub(crate) fn bodies(&self) -> Vec<Bytes> {
            self.calls.lock().iter().map(|(_, _, body)| body.clone()).collect()
        }
    }

    #[async_trait]
    impl RoundTrip for UriEchoTransport {
        async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned);
            let uri = req.uri().to_string();
            self.calls.lock().push((uri.clone(), host, req.body().clone()));
            Ok(Response::new(Bytes::from(uri)))
        }
    }

    /// Always fails the way an unreachable endpoint would.
    pub(crate) struct FailingTransport;

    #[async_trait]
    impl RoundTrip for FailingTransport {
        async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
            Err(ProxyError::RequestFailed("Connection timeout".into()))
        }
    }

    fn test_backend(transport: Arc<dyn RoundTrip>) -> Backend {
        let endpoint = Url::parse("http://someremote.backend:8080").unwrap();
        Backend::new(endpoint, "passthrough", transport).unwrap()
    }

    #[tokio::test]
    async fn rewrites_request_to_backend_authority() {
        let echo = Arc::new(UriEchoTransport::default());
        let backend = test_backend(echo.clone());

        let req = Request::builder()
            .method("GET")
            .uri("http://localhost:8080/x/y")
            .body(Bytes::new())
            .unwrap();
        backend.round_trip(req).await.unwrap();

        assert_eq!(echo.seen(), vec!["http://someremote.backend:8080/x/y"]);
    }

    #[tokio::test]
    async fn preserves_query_string() {
        let echo = Arc::new(UriEchoTransport::default());
        let backend = test_backend(echo.clone());

        let req = Request::builder()
            .uri("/bucket?list-type=2&prefix=a%2Fb")
            .body(Bytes::new())
            .unwrap();
        backend.round_trip(req).await.unwrap();

        assert_eq!(
            echo.seen(),
            vec!["http://someremote.backend:8080/bucket?list-type=2&prefix=a%2Fb"]
        );
    }

    #[tokio::test]
    async fn wraps_failures_with_backend_identity() {
        let backend = test_backend(Arc::new(FailingTransport));

        let req = Request::builder()
            .uri("http://localhost:8080/x")
            .body(Bytes::new())
            .unwrap();
        let err = backend.round_trip(req).await.unwrap_err();

        assert_eq!(err.backend(), "someremote.backend:8080");
    }

    #[tokio::test]
    async fn keeps_bucket_prefix_for_virtual_hosted_requests() {
        let echo = Arc::new(UriEchoTransport::default());
        let backend = test_backend(echo.clone());

        let req = Request::builder()
            .uri("/key")
            .header(HOST, "bucket.s3.eu-west-1.example")
            .body(Bytes::new())
            .unwrap();
        backend.round_trip(req).await.unwrap();

        assert_eq!(
            echo.hosts(),
            vec![Some("bucket.someremote.backend:8080".to_string())]
        );
    }

    #[tokio::test]
    async fn leaves_plain_hosts_alone() {
        let echo = Arc::new(UriEchoTransport::default());
        let backend = test_backend(echo.clone());

        let req = Request::builder()
            .uri("/key")
            .header(HOST, "proxy.internal:8080")
            .body(Bytes::new())
            .unwrap();
        backend.round_trip(req).await.unwrap();

        assert_eq!(echo.hosts(), vec![Some("proxy.internal:8080".to_string())]);
    }

    #[test]
    fn rehoming_requires_the_virtual_hosted_marker() {
        assert_eq!(
            rehome_s3_host("bucket.s3.eu-west-1.example", "b1.internal:9000"),
            Some("bucket.b1.internal:9000".to_string())
        );
        assert_eq!(rehome_s3_host("plain.example", "b1.internal:9000"), None);
    }

    #[test]
    fn default_port_is_omitted_from_the_name() {
        let endpoint = Url::parse("http://plain.example").unwrap();
        let backend =
            Backend::new(endpoint, "passthrough", Arc::new(FailingTransport)).unwrap();
        assert_eq!(backend.name(), "plain.example");
    }
}
