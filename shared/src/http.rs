//! HTTP plumbing shared by the proxy pipeline and the binary: the listener
//! loop, synthesized error responses, and the header hygiene every proxied
//! message needs in both directions (hop-by-hop removal, Via stamping).

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use hyper::StatusCode;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

const PROXY_NAME: &str = "shardgate";

/// Accept loop: binds `host:port` and hands every connection to hyper with
/// h1/h2 auto-detection. Runs until the listener errors.
pub async fn run_http_service<S, B, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "listening");
    let service = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service.clone();

        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}

/// Response with the canonical status reason as its body.
pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let reason = status_code.canonical_reason().unwrap_or("request failed");
    let mut response = Response::new(Bytes::from(reason));
    *response.status_mut() = status_code;
    response
}

static HOP_BY_HOP: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Prepares a proxied message's headers for the next hop: strips hop-by-hop
/// headers (HTTP/1.x only; h2 and h3 do not carry them) and appends this
/// proxy to the Via chain. Applied to requests going out to backends and to
/// responses coming back.
pub fn groom_proxied_headers(headers: &mut HeaderMap, version: Version) {
    if is_http1(version) {
        // Headers named in the Connection value are hop-by-hop too.
        let named_in_connection: Vec<HeaderName> = headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
                    .collect()
            })
            .unwrap_or_default();

        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        for name in named_in_connection {
            headers.remove(&name);
        }
        if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
            headers.remove(HeaderName::from_static("keep-alive"));
        }
    }

    stamp_via(headers, version);
}

fn stamp_via(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::warn!(?version, "unknown HTTP version, skipping Via header");
            return;
        }
    };

    let entry = format!("{version_str} {PROXY_NAME}");
    let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {entry}"),
        None => entry,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}
