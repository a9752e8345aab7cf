//! Consistent-hash sharding of the object namespace across clusters.
//!
//! Each cluster owns a number of virtual shards proportional to its weight;
//! object keys resolve to exactly one shard, bucket-level paths broadcast
//! to every backend. Rings are built once from configuration and never
//! mutated afterwards.

use crate::config::{ClientConfig, ClusterConfig};
use crate::errors::ProxyError;
use crate::storages::Backend;
use crate::transport::{MultiTransport, MultipleResponsesHandler, RoundTrip};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Hash ring with one point per virtual shard. Weighting is realized by
/// shard multiplicity, so a single point per shard is enough.
#[derive(Debug)]
struct HashRing {
    points: Vec<u32>,
    point_to_shard: HashMap<u32, String>,
}

impl HashRing {
    fn new(shard_ids: impl IntoIterator<Item = String>) -> Self {
        let mut points = Vec::new();
        let mut point_to_shard = HashMap::new();
        for shard in shard_ids {
            let point = crc32fast::hash(shard.as_bytes());
            points.push(point);
            point_to_shard.insert(point, shard);
        }
        points.sort_unstable();
        points.dedup();
        Self {
            points,
            point_to_shard,
        }
    }

    /// First ring point at or after the key's hash, wrapping around.
    fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key.as_bytes());
        let idx = match self.points.binary_search(&hash) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        self.point_to_shard
            .get(&self.points[idx])
            .map(String::as_str)
    }
}

/// A named group of backends answering for a slice of the ring.
#[derive(Debug)]
pub struct Cluster {
    pub name: String,
    pub weight: u32,
    transport: Arc<MultiTransport>,
}

impl Cluster {
    pub fn backends(&self) -> &[Arc<Backend>] {
        self.transport.backends()
    }

    pub fn transport(&self) -> &Arc<MultiTransport> {
        &self.transport
    }
}

/// Immutable routing structure: the hash ring, the shard index, and the
/// broadcast transport over the deduplicated union of every backend.
#[derive(Debug)]
pub struct ShardsRing {
    ring: HashRing,
    shard_cluster_map: HashMap<String, Arc<Cluster>>,
    all_clusters: Arc<MultiTransport>,
    // Reserved for cluster failover; not wired.
    #[allow(dead_code)]
    regression_clusters: Vec<Arc<Cluster>>,
}

impl ShardsRing {
    /// Exactly one non-empty segment after trimming slashes means a
    /// container-level operation.
    fn is_bucket_path(path: &str) -> bool {
        path.trim_matches('/').split('/').count() == 1
    }

    /// Bucket-level paths broadcast to every cluster; object paths land on
    /// the single cluster owning the key's shard.
    pub fn pick(&self, key: &str) -> Result<Arc<MultiTransport>, ProxyError> {
        if Self::is_bucket_path(key) {
            return Ok(self.all_clusters.clone());
        }

        let shard = self.ring.get(key).ok_or_else(|| ProxyError::NoClusterForShard {
            shard: String::new(),
            key: key.to_string(),
        })?;

        match self.shard_cluster_map.get(shard) {
            Some(cluster) => Ok(cluster.transport().clone()),
            None => Err(ProxyError::NoClusterForShard {
                shard: shard.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Number of virtual shards placed on the ring.
    pub fn shard_count(&self) -> usize {
        self.shard_cluster_map.len()
    }
}

#[async_trait]
impl RoundTrip for ShardsRing {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let transport = self.pick(req.uri().path())?;
        transport.round_trip(req).await
    }
}

/// Builds clusters and rings from the cluster catalog. Clusters are
/// materialized once and shared between the ring and the broadcast
/// transport.
pub struct RingFactory {
    catalog: HashMap<String, ClusterConfig>,
    transport: Arc<dyn RoundTrip>,
    handler: Arc<dyn MultipleResponsesHandler>,
    clusters: HashMap<String, Arc<Cluster>>,
}

impl RingFactory {
    pub fn new(
        catalog: HashMap<String, ClusterConfig>,
        transport: Arc<dyn RoundTrip>,
        handler: Arc<dyn MultipleResponsesHandler>,
    ) -> Self {
        Self {
            catalog,
            transport,
            handler,
            clusters: HashMap::new(),
        }
    }

    fn get_cluster(&mut self, name: &str) -> Result<Arc<Cluster>, ProxyError> {
        if let Some(cluster) = self.clusters.get(name) {
            return Ok(cluster.clone());
        }

        let config = self
            .catalog
            .get(name)
            .ok_or_else(|| ProxyError::UnknownCluster(name.to_string()))?;
        let backends = config
            .backends
            .iter()
            .map(|endpoint| {
                Backend::new(endpoint.clone(), config.kind.clone(), self.transport.clone())
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cluster = Arc::new(Cluster {
            name: name.to_string(),
            weight: config.weight,
            transport: Arc::new(MultiTransport::new(backends, self.handler.clone())),
        });

        self.clusters.insert(name.to_string(), cluster.clone());
        Ok(cluster)
    }

    /// A cluster with weight w owns floor(shards_count * w / Σweights)
    /// virtual shards named `{cluster}-{i}`.
    fn map_shards(
        &mut self,
        weight_sum: u64,
        client: &ClientConfig,
    ) -> Result<HashMap<String, Arc<Cluster>>, ProxyError> {
        let mut shard_cluster_map = HashMap::with_capacity(client.shards_count as usize);
        for name in &client.clusters {
            let cluster = self.get_cluster(name)?;
            let shards_num = u64::from(client.shards_count) * u64::from(cluster.weight) / weight_sum;
            for i in 0..shards_num {
                shard_cluster_map.insert(format!("{name}-{i}"), cluster.clone());
            }
        }
        Ok(shard_cluster_map)
    }

    /// Union of every backend across the selected clusters, first
    /// occurrence wins.
    fn uniq_backends(&mut self, client: &ClientConfig) -> Result<Vec<Arc<Backend>>, ProxyError> {
        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        for name in &client.clusters {
            let cluster = self.get_cluster(name)?;
            for backend in cluster.backends() {
                if seen.insert(backend.endpoint().to_string()) {
                    backends.push(backend.clone());
                }
            }
        }
        Ok(backends)
    }

    /// Assembles the ring for a client configuration.
    pub fn client_ring(&mut self, client: &ClientConfig) -> Result<ShardsRing, ProxyError> {
        let mut weight_sum: u64 = 0;
        for name in &client.clusters {
            weight_sum += u64::from(self.get_cluster(name)?.weight);
        }
        if weight_sum == 0 {
            return Err(ProxyError::InvalidConfig("total cluster weight is zero"));
        }

        let shard_cluster_map = self.map_shards(weight_sum, client)?;
        let ring = HashRing::new(shard_cluster_map.keys().cloned());

        let all_backends = self.uniq_backends(client)?;
        let all_clusters = Arc::new(MultiTransport::new(all_backends, self.handler.clone()));

        Ok(ShardsRing {
            ring,
            shard_cluster_map,
            all_clusters,
            regression_clusters: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::storages::tests::UriEchoTransport;
    use crate::transport::FirstSuccessHandler;
    use url::Url;

    fn cluster_config(backends: &[&str], weight: u32) -> ClusterConfig {
        ClusterConfig {
            backends: backends.iter().map(|b| Url::parse(b).unwrap()).collect(),
            weight,
            kind: "passthrough".to_string(),
        }
    }

    fn two_cluster_factory() -> RingFactory {
        let catalog = HashMap::from([
            (
                "alpha".to_string(),
                cluster_config(
                    &["http://a1.internal:9000", "http://a2.internal:9000"],
                    2,
                ),
            ),
            (
                "beta".to_string(),
                cluster_config(
                    // a2 is shared with alpha and must not be broadcast twice
                    &["http://b1.internal:9000", "http://a2.internal:9000"],
                    1,
                ),
            ),
        ]);
        RingFactory::new(
            catalog,
            Arc::new(UriEchoTransport::default()),
            Arc::new(FirstSuccessHandler),
        )
    }

    fn two_cluster_client() -> ClientConfig {
        ClientConfig {
            clusters: vec!["alpha".to_string(), "beta".to_string()],
            shards_count: 9,
        }
    }

    #[test]
    fn shards_split_by_weight() {
        let ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();

        let per_cluster = |name: &str| {
            ring.shard_cluster_map
                .values()
                .filter(|c| c.name == name)
                .count()
        };
        assert_eq!(per_cluster("alpha"), 6);
        assert_eq!(per_cluster("beta"), 3);
        assert_eq!(ring.shard_count(), 9);
    }

    #[test]
    fn floor_weighting_never_overshoots() {
        // weights that do not divide the shard count evenly
        let catalog = HashMap::from([
            ("a".to_string(), cluster_config(&["http://a.internal:9000"], 3)),
            ("b".to_string(), cluster_config(&["http://b.internal:9000"], 2)),
            ("c".to_string(), cluster_config(&["http://c.internal:9000"], 2)),
        ]);
        let mut factory = RingFactory::new(
            catalog,
            Arc::new(UriEchoTransport::default()),
            Arc::new(FirstSuccessHandler),
        );
        let client = ClientConfig {
            clusters: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            shards_count: 10,
        };

        let ring = factory.client_ring(&client).unwrap();
        // floor(10*3/7) + floor(10*2/7) * 2 = 4 + 2 + 2
        assert!(ring.shard_count() <= 10);
        assert_eq!(ring.shard_count(), 8);
    }

    #[test]
    fn object_keys_route_deterministically() {
        let ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();

        let first = ring.pick("/bucket/obj").unwrap();
        for _ in 0..10_000 {
            let again = ring.pick("/bucket/obj").unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[test]
    fn every_shard_resolves_to_its_cluster() {
        let ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();

        for shard in ring.shard_cluster_map.keys() {
            // a shard id used as a key must resolve to some ring entry
            let resolved = ring.ring.get(shard).unwrap();
            assert!(ring.shard_cluster_map.contains_key(resolved));
        }
    }

    #[test]
    fn bucket_paths_broadcast_to_deduplicated_backends() {
        let ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();

        for path in ["/bucket", "bucket/", "/bucket/", "/"] {
            let picked = ring.pick(path).unwrap();
            assert!(Arc::ptr_eq(&picked, &ring.all_clusters), "path {path:?}");
        }

        // a1, a2, b1; the shared a2 appears once
        assert_eq!(ring.all_clusters.backends().len(), 3);
    }

    #[test]
    fn object_paths_do_not_broadcast() {
        let ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();

        let picked = ring.pick("/bucket/deep/key").unwrap();
        assert!(!Arc::ptr_eq(&picked, &ring.all_clusters));
    }

    #[test]
    fn bucket_path_detection() {
        assert!(ShardsRing::is_bucket_path("/bucket"));
        assert!(ShardsRing::is_bucket_path("bucket"));
        assert!(ShardsRing::is_bucket_path("/bucket/"));
        assert!(ShardsRing::is_bucket_path("/"));
        assert!(!ShardsRing::is_bucket_path("/bucket/obj"));
        assert!(!ShardsRing::is_bucket_path("/bucket/a/b/c"));
    }

    #[test]
    fn unknown_cluster_fails_construction() {
        let client = ClientConfig {
            clusters: vec!["alpha".to_string(), "missing".to_string()],
            shards_count: 4,
        };

        let err = two_cluster_factory().client_ring(&client).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownCluster(name) if name == "missing"));
    }

    #[test]
    fn corrupt_ring_surfaces_no_cluster_for_shard() {
        let mut ring = two_cluster_factory().client_ring(&two_cluster_client()).unwrap();
        ring.shard_cluster_map.clear();

        let err = ring.pick("/bucket/obj").unwrap_err();
        assert!(matches!(err, ProxyError::NoClusterForShard { .. }));
    }

    #[test]
    fn ring_lookup_wraps_around() {
        let ring = HashRing::new(["alpha-0".to_string(), "beta-0".to_string()]);
        // any key resolves to one of the placed shards
        for key in ["/b/k1", "/b/k2", "/b/k3", "/b/zzzzzz"] {
            let shard = ring.get(key).unwrap();
            assert!(shard == "alpha-0" || shard == "beta-0");
        }
    }

    #[test]
    fn empty_ring_resolves_nothing() {
        let ring = HashRing::new(Vec::new());
        assert!(ring.get("/b/k").is_none());
    }
}
