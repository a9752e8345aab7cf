pub mod auth;
pub mod config;
pub mod decorators;
pub mod errors;
pub mod metrics_defs;
pub mod sharding;
pub mod storages;
pub mod transport;

use crate::config::Config;
use crate::decorators::{Decorator, decorate};
use crate::errors::ProxyError;
use crate::sharding::RingFactory;
use crate::transport::{FirstSuccessHandler, HttpTransport, RoundTrip};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{make_error_response, run_http_service};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(config: Config) -> Result<(), ProxyError> {
    let listener = config.listener.clone();
    let service = ProxyService::try_new(config)?;
    run_http_service(&listener.host, listener.port, service).await
}

/// Inbound service: buffers the request body once, then sends the request
/// through the decorator chain into the ring.
pub struct ProxyService {
    chain: Arc<dyn RoundTrip>,
}

impl ProxyService {
    pub fn try_new(config: Config) -> Result<Self, ProxyError> {
        let cluster_names = config
            .clusters
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(clusters = %cluster_names, "configured clusters");

        let transport: Arc<dyn RoundTrip> = Arc::new(HttpTransport::new(&config.transport));
        let handler = Arc::new(FirstSuccessHandler);
        let mut factory = RingFactory::new(config.clusters, transport, handler);
        let ring = factory.client_ring(&config.client)?;
        tracing::info!(partitions = ring.shard_count(), "ring sharded");

        let mut decorators: Vec<Decorator> = vec![decorators::access_log()];
        if let Some(crd) = &config.credentials_store {
            let store = credstore::instance(&crd.endpoint, crd.ttl_secs.map(Duration::from_secs))?;
            decorators.push(auth::access_key_gate(store, crd.service.clone()));
        }
        decorators.push(decorators::options_handler());
        decorators.push(decorators::headers_supplier(
            config.request_headers,
            config.response_headers,
        ));

        Ok(Self {
            chain: decorate(Arc::new(ring), decorators),
        })
    }
}

impl<B> Service<Request<B>> for ProxyService
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let chain = self.chain.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(make_error_response(StatusCode::BAD_REQUEST).map(Full::new));
                }
            };
            let request = Request::from_parts(parts, body);

            match chain.round_trip(request).await {
                Ok(response) => Ok(response.map(Full::new)),
                Err(err) => {
                    tracing::error!(error = %err, "request failed");
                    Ok(make_error_response(error_status(&err)).map(Full::new))
                }
            }
        })
    }
}

fn error_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::Backend(_) | ProxyError::RequestFailed(_) | ProxyError::NoResponses => {
            StatusCode::BAD_GATEWAY
        }
        ProxyError::ResponseTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
