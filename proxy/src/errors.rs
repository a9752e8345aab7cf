use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Transport-level failure annotated with the backend that produced it, so
/// the reconciliation policy can tell which endpoint misbehaved.
#[derive(Error, Debug)]
#[error("backend {backend}: {source}")]
pub struct BackendError {
    backend: String,
    source: Box<ProxyError>,
}

impl BackendError {
    pub fn new(backend: impl Into<String>, source: ProxyError) -> Self {
        Self {
            backend: backend.into(),
            source: Box::new(source),
        }
    }

    /// Authority (`host[:port]`) of the backend that failed.
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

/// Errors that can occur while routing and dispatching requests
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no cluster {0:?} in configuration")]
    UnknownCluster(String),

    #[error("no cluster for shard {shard}, cannot handle key {key}")]
    NoClusterForShard { shard: String, key: String },

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid backend endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("no backend produced a response")]
    NoResponses,

    #[error("backend request failed: {0}")]
    RequestFailed(String),

    #[error("backend response timed out")]
    ResponseTimeout,

    #[error("failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("invalid URI: {0}")]
    InvalidUriParts(#[from] http::uri::InvalidUriParts),

    #[error("credentials store error: {0}")]
    Credentials(#[from] credstore::CredStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
