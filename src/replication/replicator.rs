// Fire-and-forget fan-out of local deltas, one bounded queue per peer

use super::peer::PeerSet;
use super::PeerTransport;
use crate::clock::Clock;
use crate::error::Error;
use crate::registry::delta::DeltaRecord;
use crate::registry::{ReconcileReport, Registry};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSettings {
    /// Upper bound on a single call to a peer
    pub peer_timeout: Duration,
    /// Records buffered per peer before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(2),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug)]
pub struct Replicator {
    registry: Arc<Registry>,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    queues: HashMap<String, mpsc::Sender<DeltaRecord>>,
    settings: ReplicationSettings,
}

impl Replicator {
    /// Build the replicator and one worker per peer. The workers do nothing
    /// until spawned with [`PeerWorker::run`].
    pub fn new(
        registry: Arc<Registry>,
        peers: Arc<PeerSet>,
        transport: Arc<dyn PeerTransport>,
        settings: ReplicationSettings,
    ) -> (Self, Vec<PeerWorker>) {
        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for address in peers.addresses() {
            let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
            queues.insert(address.clone(), tx);
            workers.push(PeerWorker {
                peer: address,
                rx,
                transport: transport.clone(),
                peers: peers.clone(),
                clock: registry.clock().clone(),
                timeout: settings.peer_timeout,
            });
        }

        let replicator = Self {
            registry,
            peers,
            transport,
            queues,
            settings,
        };
        (replicator, workers)
    }

    /// Queue a locally originated record for every peer. Never blocks; a full
    /// queue drops the record for that peer.
    pub fn forward(&self, record: &DeltaRecord) {
        for (peer, queue) in &self.queues {
            match queue.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer, sequence = record.sequence, "Replication queue full, dropping record");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer = %peer, "Replication worker stopped");
                }
            }
        }
    }

    /// Pull every peer's full registry and merge it into the local one
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let pulls = self.peers.addresses().into_iter().map(|peer| async move {
            let report = self.reconcile_with(&peer).await;
            (peer, report)
        });

        let mut total = ReconcileReport::default();
        for (peer, report) in join_all(pulls).await {
            if let Some(report) = report {
                debug!(peer = %peer, applied = report.applied, discarded = report.discarded, "Reconciled");
                total.applied += report.applied;
                total.discarded += report.discarded;
                total.rejected += report.rejected;
            }
        }
        total
    }

    /// Merge one peer's registry. `None` when the peer could not be reached.
    pub async fn reconcile_with(&self, peer: &str) -> Option<ReconcileReport> {
        let fetched =
            tokio::time::timeout(self.settings.peer_timeout, self.transport.fetch_registry(peer)).await;

        match flatten(peer, fetched) {
            Ok(snapshot) => {
                if self.peers.mark_healthy(peer, self.registry.clock().now_ms()) {
                    info!(peer = %peer, "Peer reachable again");
                }
                Some(self.registry.reconcile(&snapshot))
            }
            Err(e @ Error::PeerRejected { .. }) => {
                self.peers.mark_healthy(peer, self.registry.clock().now_ms());
                warn!(error = %e, "Reconciliation pull refused");
                None
            }
            Err(e) => {
                if self.peers.mark_unreachable(peer, &e.to_string()) {
                    warn!(error = %e, "Reconciliation pull failed");
                } else {
                    debug!(error = %e, "Reconciliation pull failed");
                }
                None
            }
        }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }
}

/// Drains one peer's queue in order
#[derive(Debug)]
pub struct PeerWorker {
    peer: String,
    rx: mpsc::Receiver<DeltaRecord>,
    transport: Arc<dyn PeerTransport>,
    peers: Arc<PeerSet>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PeerWorker {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Deliver queued records until cancelled. An in-flight call is abandoned on cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(peer = %self.peer, "Replication worker started");
        loop {
            let record = tokio::select! {
                () = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            let call = tokio::time::timeout(self.timeout, self.transport.replicate(&self.peer, &record));
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = call => result,
            };

            match flatten(&self.peer, result) {
                Ok(outcome) => {
                    self.answered();
                    debug!(peer = %self.peer, sequence = record.sequence, ?outcome, "Replicated");
                }
                Err(e @ Error::PeerRejected { .. }) => {
                    self.answered();
                    warn!(error = %e, sequence = record.sequence, "Peer rejected record, dropping it");
                }
                Err(e) => {
                    if self.peers.mark_unreachable(&self.peer, &e.to_string()) {
                        warn!(error = %e, sequence = record.sequence, "Replication failed, dropping record");
                    } else {
                        debug!(error = %e, sequence = record.sequence, "Replication failed, dropping record");
                    }
                }
            }
        }
        debug!(peer = %self.peer, "Replication worker stopped");
    }

    fn answered(&self) {
        if self.peers.mark_healthy(&self.peer, self.clock.now_ms()) {
            info!(peer = %self.peer, "Peer reachable again");
        }
    }
}

fn flatten<T>(
    peer: &str,
    result: std::result::Result<crate::Result<T>, tokio::time::error::Elapsed>,
) -> crate::Result<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e @ (Error::PeerUnreachable { .. } | Error::PeerRejected { .. }))) => Err(e),
        Ok(Err(e)) => Err(Error::PeerUnreachable {
            peer: peer.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::PeerUnreachable {
            peer: peer.to_string(),
            reason: "timed out".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::instance::{Instance, InstanceKey};
    use crate::registry::query::RegistrySnapshot;
    use crate::registry::store::ApplyOutcome;
    use crate::registry::RegistryConfig;
    use crate::replication::peer::PeerHealth;
    use crate::NodeId;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Applies records straight into a target registry, or fails on demand
    #[derive(Debug)]
    struct DirectTransport {
        target: Arc<Registry>,
        down: Mutex<bool>,
        delivered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PeerTransport for DirectTransport {
        async fn replicate(&self, peer: &str, record: &DeltaRecord) -> crate::Result<ApplyOutcome> {
            if *self.down.lock() {
                return Err(Error::PeerUnreachable {
                    peer: peer.to_string(),
                    reason: "connection refused".into(),
                });
            }
            self.delivered.lock().push(record.sequence);
            self.target.apply_peer(record).map_err(|e| Error::PeerRejected {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
        }

        async fn fetch_registry(&self, peer: &str) -> crate::Result<RegistrySnapshot> {
            if *self.down.lock() {
                return Err(Error::PeerUnreachable {
                    peer: peer.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self.target.full_registry())
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::with_clock(
                NodeId::new(),
                RegistryConfig::default(),
                Arc::new(ManualClock::new(1_000_000)),
            )
            .unwrap(),
        )
    }

    fn setup(capacity: usize) -> (Replicator, Vec<PeerWorker>, Arc<Registry>, Arc<Registry>, Arc<DirectTransport>) {
        let local = registry();
        let remote = registry();
        let transport = Arc::new(DirectTransport {
            target: remote.clone(),
            down: Mutex::new(false),
            delivered: Mutex::new(Vec::new()),
        });
        let (replicator, workers) = Replicator::new(
            local.clone(),
            Arc::new(PeerSet::new(["http://peer-1"])),
            transport.clone(),
            ReplicationSettings {
                peer_timeout: Duration::from_secs(1),
                queue_capacity: capacity,
            },
        );
        (replicator, workers, local, remote, transport)
    }

    #[tokio::test]
    async fn test_forward_delivers_in_order() {
        let (replicator, mut workers, local, remote, transport) = setup(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(workers.remove(0).run(cancel.clone()));

        let key = InstanceKey::new("billing", "b-1");
        replicator.forward(&local.register(Instance::new("billing", "b-1", "h", 80)).unwrap());
        replicator.forward(&local.renew(&key).unwrap());

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.delivered.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*transport.delivered.lock(), vec![1, 2]);
        assert!(remote.instance(&key).is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (replicator, mut workers, local, remote, transport) = setup(2);

        // no worker is draining yet; only the first two records fit
        for id in 0..5 {
            let record = local
                .register(Instance::new("billing", format!("b-{id}"), "h", 80))
                .unwrap();
            replicator.forward(&record);
        }
        assert_eq!(local.len(), 5);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(workers.remove(0).run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.delivered.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // the worker is idle on an empty queue; nothing else was buffered
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*transport.delivered.lock(), vec![1, 2]);
        assert_eq!(remote.len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_record_keeps_peer_healthy() {
        let (replicator, mut workers, local, remote, transport) = setup(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(workers.remove(0).run(cancel.clone()));

        let mut record = local
            .register(Instance::new("billing", "b-1", "h", 80))
            .unwrap();
        record.instance.address.port = 0;
        replicator.forward(&record);

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.delivered.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(remote.is_empty());
        let peer = replicator.peers().get("http://peer-1").unwrap();
        assert_eq!(peer.health, PeerHealth::Healthy);
        assert_eq!(peer.consecutive_failures, 0);
        assert!(peer.last_contact_ms.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_marks_peer_unreachable() {
        let (replicator, mut workers, local, remote, transport) = setup(16);
        *transport.down.lock() = true;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(workers.remove(0).run(cancel.clone()));
        replicator.forward(&local.register(Instance::new("billing", "b-1", "h", 80)).unwrap());

        tokio::time::timeout(Duration::from_secs(5), async {
            while replicator.peers().get("http://peer-1").unwrap().health != PeerHealth::Unreachable {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(remote.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_heals_dropped_records() {
        let (replicator, _workers, local, remote, transport) = setup(16);
        remote.register(Instance::new("orders", "o-1", "h", 81)).unwrap();

        *transport.down.lock() = true;
        assert_eq!(replicator.reconcile_all().await, ReconcileReport::default());
        assert!(local.is_empty());

        *transport.down.lock() = false;
        let report = replicator.reconcile_all().await;
        assert_eq!(report.applied, 1);
        assert!(local.instance(&InstanceKey::new("orders", "o-1")).is_some());
        assert_eq!(
            replicator.peers().get("http://peer-1").unwrap().health,
            PeerHealth::Healthy
        );
    }
}
