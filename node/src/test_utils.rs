use crate::config::NodeConfig;
use crate::node::RegistryNode;
use crate::tasks::Supervisor;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use regis::{
    ApplyOutcome, DeltaRecord, Error, ManualClock, PeerTransport, RegistryConfig, RegistrySnapshot,
    ReplicationSettings, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// In-process network between test nodes, addressed by name
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    nodes: DashMap<String, Arc<RegistryNode>>,
    partitions: DashSet<(String, String)>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, address: impl Into<String>, node: Arc<RegistryNode>) {
        self.nodes.insert(address.into(), node);
    }

    /// Transport as seen from `from`
    pub fn transport(self: &Arc<Self>, from: impl Into<String>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            from: from.into(),
            network: self.clone(),
        })
    }

    pub fn partition(&self, a: &str, b: &str) {
        self.partitions.insert((a.to_string(), b.to_string()));
        self.partitions.insert((b.to_string(), a.to_string()));
    }

    pub fn heal_partition(&self, a: &str, b: &str) {
        self.partitions.remove(&(a.to_string(), b.to_string()));
        self.partitions.remove(&(b.to_string(), a.to_string()));
    }

    fn reach(&self, from: &str, to: &str) -> Result<Arc<RegistryNode>> {
        if self.partitions.contains(&(from.to_string(), to.to_string())) {
            return Err(Error::PeerUnreachable {
                peer: to.to_string(),
                reason: "network partition".into(),
            });
        }
        self.nodes
            .get(to)
            .map(|n| n.clone())
            .ok_or_else(|| Error::PeerUnreachable {
                peer: to.to_string(),
                reason: "no such node".into(),
            })
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    from: String,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn replicate(&self, peer: &str, record: &DeltaRecord) -> Result<ApplyOutcome> {
        let node = self.network.reach(&self.from, peer)?;
        // simulate the wire
        let record: DeltaRecord = serde_json::from_value(
            serde_json::to_value(record).map_err(|e| Error::Other(e.into()))?,
        )
        .map_err(|e| Error::Other(e.into()))?;
        tokio::task::yield_now().await;
        node.apply_peer(&record).map_err(|e| Error::PeerRejected {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }

    async fn fetch_registry(&self, peer: &str) -> Result<RegistrySnapshot> {
        let node = self.network.reach(&self.from, peer)?;
        tokio::task::yield_now().await;
        Ok(node.registry().full_registry())
    }
}

pub struct TestCluster {
    pub nodes: Vec<Arc<RegistryNode>>,
    pub addresses: Vec<String>,
    pub network: Arc<LoopbackNetwork>,
    pub clock: ManualClock,
    pub supervisor: Supervisor,
}

impl TestCluster {
    pub fn node(&self, i: usize) -> &Arc<RegistryNode> {
        &self.nodes[i]
    }

    /// Wait until `check` holds, yielding to the replication workers in between
    pub async fn eventually<F>(&self, mut check: F) -> bool
    where
        F: FnMut(&TestCluster) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check(self)
    }

    /// True when every node serves the same instances
    pub fn converged(&self) -> bool {
        let views: Vec<_> = self
            .nodes
            .iter()
            .map(|n| {
                n.registry()
                    .full_registry()
                    .instances
                    .into_iter()
                    .map(|mut i| {
                        // renewal times are local to each node
                        i.last_renewal_timestamp = 0;
                        i.registration_timestamp = 0;
                        i
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        views.windows(2).all(|w| w[0] == w[1])
    }

    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
    }
}

/// `size` fully meshed nodes sharing one manual clock, with replication
/// workers running but no periodic sweeps (tests drive those directly).
pub fn create_test_cluster(size: usize, registry: RegistryConfig) -> Result<TestCluster> {
    let network = LoopbackNetwork::new();
    let clock = ManualClock::new(1_000_000);
    let supervisor = Supervisor::new();
    let addresses: Vec<String> = (0..size).map(|i| format!("http://node-{i}")).collect();

    let mut nodes = Vec::with_capacity(size);
    for address in &addresses {
        let peers = addresses.iter().filter(|a| *a != address).cloned().collect();
        let config = NodeConfig::new()
            .with_registry(registry.clone())
            .with_replication(ReplicationSettings {
                peer_timeout: Duration::from_secs(1),
                queue_capacity: 1024,
            })
            .with_peers(peers);

        let node = RegistryNode::with_clock(
            config,
            network.transport(address.clone()),
            Arc::new(clock.clone()),
        )?;
        network.attach(address.clone(), node.clone());
        node.start_replication(&supervisor);
        nodes.push(node);
    }

    Ok(TestCluster {
        nodes,
        addresses,
        network,
        clock,
        supervisor,
    })
}
