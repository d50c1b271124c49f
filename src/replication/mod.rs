// Peer replication: best-effort fan-out of local mutations plus periodic
// full-registry reconciliation to heal whatever the fan-out dropped.

pub mod peer;
pub mod replicator;

use crate::error::Result;
use crate::registry::delta::DeltaRecord;
use crate::registry::query::RegistrySnapshot;
use crate::registry::store::ApplyOutcome;
use async_trait::async_trait;

/// How a node talks to its siblings. Peers are addressed by base URL.
#[async_trait]
pub trait PeerTransport: Send + Sync + std::fmt::Debug {
    /// Deliver one record for the peer to apply
    async fn replicate(&self, peer: &str, record: &DeltaRecord) -> Result<ApplyOutcome>;

    /// Pull the peer's full registry
    async fn fetch_registry(&self, peer: &str) -> Result<RegistrySnapshot>;
}
