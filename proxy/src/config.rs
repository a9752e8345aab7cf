use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub listener: Listener,
    /// Cluster catalog: every cluster the proxy knows about.
    pub clusters: HashMap<String, ClusterConfig>,
    /// Which clusters serve the client namespace, and how finely it shards.
    pub client: ClientConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub credentials_store: Option<CredentialsStoreConfig>,
    /// Request headers set only when the client did not send them.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Response headers set only when the backend did not send them.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub backends: Vec<Url>,
    pub weight: u32,
    #[serde(default = "default_cluster_kind", rename = "type")]
    pub kind: String,
}

fn default_cluster_kind() -> String {
    "passthrough".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub clusters: Vec<String>,
    pub shards_count: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_idle_conns_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 500,
            response_timeout_ms: 30_000,
            max_idle_conns_per_host: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CredentialsStoreConfig {
    /// Base URL of the credentials service; lookups are
    /// `GET {endpoint}/{access_key}/{backend}`.
    pub endpoint: String,
    /// Backend label the authorization gate looks credentials up under.
    pub service: String,
    /// Overrides the default entry TTL.
    pub ttl_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
            clusters:
                eu-west:
                    backends: [http://s3-eu-1.internal:9000, http://s3-eu-2.internal:9000]
                    weight: 2
                us-east:
                    backends: [http://s3-us-1.internal:9000]
                    weight: 1
                    type: passthrough
            client:
                clusters: [eu-west, us-east]
                shards_count: 64
            transport:
                response_timeout_ms: 5000
            credentials_store:
                endpoint: http://credentials.internal:8090
                service: s3
                ttl_secs: 30
            request_headers:
                Cache-Control: public, s-maxage=600
            response_headers:
                Access-Control-Allow-Origin: "*"
            "#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse config");

        assert_eq!(
            config.listener,
            Listener {
                host: "0.0.0.0".into(),
                port: 8080
            }
        );
        let eu = &config.clusters["eu-west"];
        assert_eq!(eu.backends.len(), 2);
        assert_eq!(eu.weight, 2);
        assert_eq!(eu.kind, "passthrough");
        assert_eq!(config.client.shards_count, 64);
        // defaults fill in what the file leaves out
        assert_eq!(config.transport.response_timeout_ms, 5000);
        assert_eq!(config.transport.connect_timeout_ms, 500);
        assert_eq!(
            config.credentials_store,
            Some(CredentialsStoreConfig {
                endpoint: "http://credentials.internal:8090".into(),
                service: "s3".into(),
                ttl_secs: Some(30),
            })
        );
        assert_eq!(config.request_headers["Cache-Control"], "public, s-maxage=600");
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let yaml = r#"
            listener: {host: 127.0.0.1, port: 7000}
            clusters:
                local: {backends: [http://127.0.0.1:9000], weight: 1}
            client: {clusters: [local], shards_count: 8}
            "#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse config");

        assert_eq!(config.transport, TransportConfig::default());
        assert!(config.credentials_store.is_none());
        assert!(config.request_headers.is_empty());
        assert!(config.response_headers.is_empty());
    }
}
