//! TTL-bounded credentials cache fronting a remote credentials service.
//!
//! Stores are partitioned per service endpoint and registered process-wide:
//! the first [`instance`] call for an endpoint creates the store, every
//! later call returns the same one. Each store caches `(access_key,
//! backend)` pairs, refreshes them with single-flight discipline, and
//! caches negative results so missing keys do not hammer the service.

pub mod metrics_defs;
mod store;

pub use store::{CredStoreError, Credentials, CredentialsStore, DEFAULT_TTL};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static INSTANCES: OnceLock<Mutex<HashMap<String, Arc<CredentialsStore>>>> = OnceLock::new();

/// Store registry keyed by endpoint. The first call for an endpoint decides
/// its TTL; later calls return the existing instance unchanged.
pub fn instance(
    endpoint: &str,
    ttl: Option<Duration>,
) -> Result<Arc<CredentialsStore>, CredStoreError> {
    let mut instances = INSTANCES.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(store) = instances.get(endpoint) {
        return Ok(store.clone());
    }

    let store = Arc::new(CredentialsStore::with_ttl(
        endpoint,
        ttl.unwrap_or(DEFAULT_TTL),
    )?);
    instances.insert(endpoint.to_owned(), store.clone());
    Ok(store)
}
