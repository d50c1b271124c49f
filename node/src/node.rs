// A registry node: the engine, its replicator and the background tasks wired together

use crate::config::NodeConfig;
use crate::tasks::Supervisor;
use regis::{
    ApplyOutcome, Clock, DeltaRecord, GovernorReport, GovernorState, Instance, InstanceKey,
    InstanceStatus, PeerSet, PeerTransport, PeerWorker, ReconcileReport, Registry, Replicator,
    Result, SweepReport, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub governor_state: GovernorState,
    /// Last governor evaluation, absent before the first one
    pub governor: Option<GovernorReport>,
    pub instance_count: usize,
    pub latest_sequence: u64,
    pub peer_count: usize,
    pub healthy_peers: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
pub struct RegistryNode {
    config: NodeConfig,
    registry: Arc<Registry>,
    replicator: Replicator,
    workers: parking_lot::Mutex<Vec<PeerWorker>>,
}

impl RegistryNode {
    pub fn new(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let registry = Arc::new(Registry::with_clock(
            config.node_id,
            config.registry.clone(),
            clock,
        )?);
        let peers = Arc::new(PeerSet::new(config.peers.iter().cloned()));
        let (replicator, workers) =
            Replicator::new(registry.clone(), peers, transport, config.replication.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            replicator,
            workers: parking_lot::Mutex::new(workers),
        }))
    }

    /// Spawn replication workers and the periodic sweeps under `supervisor`
    pub fn start(self: &Arc<Self>, supervisor: &Supervisor) {
        self.start_replication(supervisor);

        let node = self.clone();
        supervisor.spawn_periodic("eviction", self.config.eviction_interval, move || {
            let node = node.clone();
            async move {
                node.evict_expired();
            }
        });

        let node = self.clone();
        supervisor.spawn_periodic("governor", self.config.governor_interval, move || {
            let node = node.clone();
            async move {
                node.registry.evaluate_governor();
            }
        });

        let node = self.clone();
        supervisor.spawn_periodic("retention", self.config.retention_interval, move || {
            let node = node.clone();
            async move {
                node.registry.prune();
            }
        });

        if !self.config.peers.is_empty() {
            let node = self.clone();
            supervisor.spawn("initial-reconcile", async move {
                node.reconcile().await;
            });

            let node = self.clone();
            supervisor.spawn_periodic("reconcile", self.config.reconcile_interval, move || {
                let node = node.clone();
                async move {
                    node.reconcile().await;
                }
            });
        }

        info!(
            node_id = %self.registry.node_id(),
            peers = self.config.peers.len(),
            "Registry node started"
        );
    }

    /// Spawn only the replication workers. Calling it again is a no-op.
    pub fn start_replication(&self, supervisor: &Supervisor) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = format!("replicate:{}", worker.peer());
            supervisor.spawn(name, worker.run(supervisor.token()));
        }
    }

    pub fn register(&self, instance: Instance) -> Result<DeltaRecord> {
        let record = self.registry.register(instance)?;
        self.replicator.forward(&record);
        Ok(record)
    }

    pub fn renew(&self, key: &InstanceKey) -> Result<DeltaRecord> {
        let record = self.registry.renew(key)?;
        self.replicator.forward(&record);
        Ok(record)
    }

    pub fn cancel(&self, key: &InstanceKey) -> Option<DeltaRecord> {
        let record = self.registry.cancel(key)?;
        self.replicator.forward(&record);
        Some(record)
    }

    pub fn set_status(&self, key: &InstanceKey, status: InstanceStatus) -> Result<DeltaRecord> {
        let record = self.registry.set_status(key, status)?;
        self.replicator.forward(&record);
        Ok(record)
    }

    /// Apply a record received from a peer. Never forwarded again.
    pub fn apply_peer(&self, record: &DeltaRecord) -> Result<ApplyOutcome> {
        self.registry.apply_peer(record)
    }

    /// Run one expiry sweep and pass the evictions on to peers as hints
    pub fn evict_expired(&self) -> SweepReport {
        let report = self.registry.evict_expired();
        for record in &report.evicted {
            self.replicator.forward(record);
        }
        report
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        let report = self.replicator.reconcile_all().await;
        if report.applied > 0 {
            info!(applied = report.applied, "Reconciliation adopted peer state");
        }
        if report.rejected > 0 {
            warn!(rejected = report.rejected, "Reconciliation rejected peer entries");
        }
        report
    }

    pub fn status(&self) -> NodeStatus {
        let peers = self.replicator.peers().list();
        NodeStatus {
            node_id: self.registry.node_id().to_string(),
            governor_state: self.registry.governor_state(),
            governor: self.registry.last_governor_report(),
            instance_count: self.registry.len(),
            latest_sequence: self.registry.latest_sequence(),
            peer_count: peers.len(),
            healthy_peers: peers
                .iter()
                .filter(|p| p.health == regis::PeerHealth::Healthy)
                .count(),
            uptime_seconds: self.registry.uptime().as_secs(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        self.replicator.peers()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
