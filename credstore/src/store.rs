use crate::metrics_defs::CREDENTIALS_REFRESH;
use parking_lot::RwLock;
use serde::Deserialize;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

// Once less than (1 - REFRESH_FRACTION) of the TTL remains, reads trigger a
// background refresh instead of waiting for expiry.
const REFRESH_FRACTION: f64 = 0.80;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(50);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
const REDIRECT_LIMIT: usize = 1;
const KEY_SEPARATOR: &str = "_____";

#[derive(Error, Debug, Clone)]
pub enum CredStoreError {
    /// The credentials service answered 404. Cached negatively for a TTL.
    #[error("credentials not found")]
    NotFound,

    /// Timeout, unexpected status, or a malformed response.
    #[error("{0}")]
    Transient(String),

    #[error("failed to build credentials HTTP client: {0}")]
    ClientInit(String),
}

/// Credential material handed to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Deserialize)]
struct CredentialsPayload {
    access_key: String,
    secret_key: String,
    // additional fields in the service response are ignored
}

/// One cached lookup. An empty `access_key` marks a sentinel entry: either
/// a cached 404 or a failed fetch with no prior material. `last_error`
/// sticks around so callers can tell the two apart.
#[derive(Clone)]
struct CacheEntry {
    access_key: String,
    secret_key: String,
    eol: Instant,
    last_error: Option<CredStoreError>,
}

impl CacheEntry {
    fn into_result(self) -> Result<Credentials, CredStoreError> {
        if self.access_key.is_empty() {
            Err(self.last_error.unwrap_or(CredStoreError::NotFound))
        } else {
            Ok(Credentials {
                access_key: self.access_key,
                secret_key: self.secret_key,
            })
        }
    }
}

/// Per-endpoint credentials cache. Entries are created on first demand,
/// overwritten on refresh, and never deleted; every successful refresh
/// pushes `eol` forward by one TTL.
pub struct CredentialsStore {
    endpoint: String,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    // Serializes refreshes: one permit means at most one in-flight fetch
    // per store.
    refresh_lock: Semaphore,
    client: reqwest::Client,
}

fn cache_key(access_key: &str, backend: &str) -> String {
    format!("{access_key}{KEY_SEPARATOR}{backend}")
}

impl CredentialsStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, CredStoreError> {
        Self::with_ttl(endpoint, DEFAULT_TTL)
    }

    pub fn with_ttl(endpoint: impl Into<String>, ttl: Duration) -> Result<Self, CredStoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(REDIRECT_LIMIT))
            .build()
            .map_err(|e| CredStoreError::ClientInit(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            cache: RwLock::new(HashMap::new()),
            ttl,
            refresh_lock: Semaphore::new(1),
            client,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolves `(access_key, backend)` from the cache, refreshing as
    /// needed: a missing, sentinel, or expired entry blocks on a refresh;
    /// an entry near expiry is served as-is while a background refresh
    /// runs; a fresh entry is served directly.
    pub async fn get(
        self: &Arc<Self>,
        access_key: &str,
        backend: &str,
    ) -> Result<Credentials, CredStoreError> {
        let key = cache_key(access_key, backend);
        let entry = self.cache.read().get(&key).cloned();
        let now = Instant::now();

        let entry = match entry {
            None => return self.refresh_blocking(access_key, backend, &key).await,
            Some(entry) if entry.access_key.is_empty() || now > entry.eol => {
                return self.refresh_blocking(access_key, backend, &key).await;
            }
            Some(entry) => entry,
        };

        if self.within_soft_refresh_window(&entry, now) {
            let store = self.clone();
            let access_key = access_key.to_owned();
            let backend = backend.to_owned();
            tokio::spawn(async move {
                store.refresh_background(&access_key, &backend).await;
            });
        }

        Ok(Credentials {
            access_key: entry.access_key,
            secret_key: entry.secret_key,
        })
    }

    /// True once less than `1 - REFRESH_FRACTION` of the TTL remains.
    fn within_soft_refresh_window(&self, entry: &CacheEntry, now: Instant) -> bool {
        let margin = self.ttl.mul_f64(1.0 - REFRESH_FRACTION);
        entry
            .eol
            .checked_sub(margin)
            .is_none_or(|threshold| now > threshold)
    }

    async fn refresh_blocking(
        &self,
        access_key: &str,
        backend: &str,
        key: &str,
    ) -> Result<Credentials, CredStoreError> {
        let _permit = self
            .refresh_lock
            .acquire()
            .await
            .map_err(|_| CredStoreError::Transient("refresh lock closed".into()))?;

        // Another caller may have refreshed this key while we waited; a
        // fresh entry (including a fresh negative one) is the answer.
        if let Some(entry) = self.cache.read().get(key).cloned()
            && Instant::now() < entry.eol
        {
            return entry.into_result();
        }

        self.refresh(access_key, backend, key).await
    }

    async fn refresh_background(&self, access_key: &str, backend: &str) {
        let key = cache_key(access_key, backend);
        // A refresh already in flight is good enough; do not queue behind it.
        let Ok(_permit) = self.refresh_lock.try_acquire() else {
            return;
        };

        // The entry may have left the soft-refresh window while the spawn
        // was pending.
        if let Some(entry) = self.cache.read().get(&key).cloned()
            && !self.within_soft_refresh_window(&entry, Instant::now())
        {
            return;
        }

        if let Err(err) = self.refresh(access_key, backend, &key).await {
            tracing::warn!(%key, error = %err, "background credentials refresh failed");
        }
    }

    /// Fetches from the service and rewrites the cache entry. A failed
    /// fetch keeps any prior material but still advances `eol`, so the
    /// next retry waits out a full TTL.
    async fn refresh(
        &self,
        access_key: &str,
        backend: &str,
        key: &str,
    ) -> Result<Credentials, CredStoreError> {
        let previous = self.cache.read().get(key).cloned();
        let outcome = self.fetch_from_service(access_key, backend).await;
        let eol = Instant::now() + self.ttl;

        let entry = match outcome {
            Ok(credentials) => {
                counter!(CREDENTIALS_REFRESH, "result" => "ok").increment(1);
                CacheEntry {
                    access_key: credentials.access_key,
                    secret_key: credentials.secret_key,
                    eol,
                    last_error: None,
                }
            }
            Err(CredStoreError::NotFound) => {
                counter!(CREDENTIALS_REFRESH, "result" => "not_found").increment(1);
                CacheEntry {
                    access_key: String::new(),
                    secret_key: String::new(),
                    eol,
                    last_error: Some(CredStoreError::NotFound),
                }
            }
            Err(err) => {
                counter!(CREDENTIALS_REFRESH, "result" => "error").increment(1);
                tracing::warn!(key, error = %err, "credentials refresh failed");
                let (access_key, secret_key) = previous
                    .map(|p| (p.access_key, p.secret_key))
                    .unwrap_or_default();
                CacheEntry {
                    access_key,
                    secret_key,
                    eol,
                    last_error: Some(err),
                }
            }
        };

        self.cache.write().insert(key.to_owned(), entry.clone());
        entry.into_result()
    }

    async fn fetch_from_service(
        &self,
        access_key: &str,
        backend: &str,
    ) -> Result<Credentials, CredStoreError> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            access_key,
            backend
        );
        let response = self.client.get(&url).send().await.map_err(|e| {
            CredStoreError::Transient(format!("credentials service unreachable: {e}"))
        })?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(CredStoreError::NotFound),
            reqwest::StatusCode::OK => {
                let body = response.text().await.map_err(|e| {
                    CredStoreError::Transient(format!("failed to read credentials response: {e}"))
                })?;
                if body.is_empty() {
                    return Err(CredStoreError::Transient(
                        "empty credentials response".into(),
                    ));
                }
                let payload: CredentialsPayload = serde_json::from_str(&body).map_err(|e| {
                    CredStoreError::Transient(format!("malformed credentials response: {e}"))
                })?;
                Ok(Credentials {
                    access_key: payload.access_key,
                    secret_key: payload.secret_key,
                })
            }
            status => Err(CredStoreError::Transient(format!(
                "credentials service returned {status}"
            ))),
        }
    }
}
