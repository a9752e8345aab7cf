//! Authorization gate: resolves the caller's access key against the
//! credentials service before the request is allowed through.

use crate::decorators::Decorator;
use crate::errors::ProxyError;
use crate::transport::RoundTrip;
use async_trait::async_trait;
use credstore::{CredStoreError, CredentialsStore};
use http::header::AUTHORIZATION;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use shared::http::make_error_response;
use std::sync::Arc;

struct AccessKeyGate {
    store: Arc<CredentialsStore>,
    service: String,
    inner: Arc<dyn RoundTrip>,
}

pub fn access_key_gate(store: Arc<CredentialsStore>, service: String) -> Decorator {
    Box::new(move |inner| {
        Arc::new(AccessKeyGate {
            store,
            service,
            inner,
        })
    })
}

#[async_trait]
impl RoundTrip for AccessKeyGate {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let Some(access_key) = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(extract_access_key)
            .map(str::to_owned)
        else {
            // Anonymous requests are judged by the backends themselves.
            return self.inner.round_trip(req).await;
        };

        match self.store.get(&access_key, &self.service).await {
            Ok(_) => self.inner.round_trip(req).await,
            Err(CredStoreError::NotFound) => {
                tracing::debug!(%access_key, "unknown access key");
                Ok(make_error_response(StatusCode::FORBIDDEN))
            }
            Err(err) => {
                tracing::warn!(%access_key, error = %err, "credentials lookup failed");
                Ok(make_error_response(StatusCode::SERVICE_UNAVAILABLE))
            }
        }
    }
}

/// Pulls the access key out of either signature scheme:
/// `AWS4-HMAC-SHA256 Credential=AKID/date/region/s3/aws4_request, ...` or
/// the legacy `AWS AKID:signature`.
fn extract_access_key(authorization: &str) -> Option<&str> {
    if let Some(rest) = authorization.strip_prefix("AWS4-HMAC-SHA256") {
        let credential = rest.split("Credential=").nth(1)?;
        return credential.split('/').next().filter(|key| !key.is_empty());
    }
    let rest = authorization.strip_prefix("AWS ")?;
    rest.split(':').next().filter(|key| !key.is_empty())
}
