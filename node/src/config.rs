// Server configuration: engine settings plus the node's intervals and peers

use regis::{Error, NodeId, RegistryConfig, ReplicationSettings, Result};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8761";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub node_id: NodeId,
    pub registry: RegistryConfig,
    pub replication: ReplicationSettings,
    /// Base URLs of sibling registry nodes
    pub peers: Vec<String>,
    pub eviction_interval: Duration,
    pub governor_interval: Duration,
    pub retention_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8761)),
            node_id: NodeId::new(),
            registry: RegistryConfig::default(),
            replication: ReplicationSettings::default(),
            peers: Vec::new(),
            eviction_interval: Duration::from_secs(30),
            governor_interval: Duration::from_secs(5),
            retention_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationSettings) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_governor_interval(mut self, interval: Duration) -> Self {
        self.governor_interval = interval;
        self
    }

    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;

        for (name, interval) in [
            ("eviction interval", self.eviction_interval),
            ("governor interval", self.governor_interval),
            ("retention interval", self.retention_interval),
            ("reconcile interval", self.reconcile_interval),
            ("peer timeout", self.replication.peer_timeout),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.replication.queue_capacity == 0 {
            return Err(Error::Config("replication queue capacity must be positive".into()));
        }
        for peer in &self.peers {
            parse_peer(peer)?;
        }
        Ok(())
    }
}

/// Parse a comma separated peer list such as `http://10.0.0.2:8761,http://10.0.0.3:8761`.
///
/// Empty items are skipped, trailing slashes dropped and duplicates removed.
pub fn parse_peers(list: &str) -> Result<Vec<String>> {
    let mut peers = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let peer = parse_peer(item)?;
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }
    Ok(peers)
}

fn parse_peer(peer: &str) -> Result<String> {
    let url = reqwest::Url::parse(peer)
        .map_err(|e| Error::Config(format!("invalid peer address {peer:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::Config(format!(
            "peer address {peer:?} must be an http(s) URL with a host"
        )));
    }
    Ok(peer.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers(" http://10.0.0.2:8761/, ,http://10.0.0.3:8761,http://10.0.0.2:8761").unwrap();
        assert_eq!(peers, vec!["http://10.0.0.2:8761", "http://10.0.0.3:8761"]);
        assert!(parse_peers("").unwrap().is_empty());
    }

    #[test]
    fn test_unparseable_peer_is_config_error() {
        assert!(matches!(parse_peers("10.0.0.2:8761"), Err(Error::Config(_))));
        assert!(matches!(parse_peers("ftp://10.0.0.2"), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        assert!(NodeConfig::default().validate().is_ok());
        let config = NodeConfig::new().with_eviction_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_bind_addr_matches_constant() {
        let parsed: SocketAddr = DEFAULT_BIND_ADDR.parse().unwrap();
        assert_eq!(parsed, NodeConfig::default().bind_addr);
    }

    proptest! {
        #[test]
        fn prop_parsed_peers_are_unique_and_reparse(
            hosts in prop::collection::vec((1u8..=254, 1024u16..65535, any::<bool>()), 0..8)
        ) {
            let list = hosts
                .iter()
                .map(|(h, port, slash)| format!("http://10.0.0.{h}:{port}{}", if *slash { "/" } else { "" }))
                .collect::<Vec<_>>()
                .join(",");
            let peers = parse_peers(&list).unwrap();

            let unique: std::collections::HashSet<&String> = peers.iter().collect();
            prop_assert_eq!(unique.len(), peers.len());
            prop_assert!(peers.iter().all(|p| !p.ends_with('/')));
            prop_assert_eq!(parse_peers(&peers.join(",")).unwrap(), peers);
        }
    }
}
