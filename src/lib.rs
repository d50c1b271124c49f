//! Regis: an eventually-consistent service registry engine.
//!
//! Instances register under a service name, keep their lease alive with
//! periodic renewals and disappear when the expiry sweep finds their lease
//! past its deadline. A self-preservation governor suspends those evictions
//! when renewals collapse across the whole registry, which usually means a
//! network partition rather than mass instance death.
//!
//! Every mutation lands in a bounded delta log (for incremental client sync)
//! and is fanned out to sibling registry nodes, which resolve conflicts by
//! last-writer-wins on hybrid logical timestamps.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod error;
pub mod hlc;
pub mod registry;
pub mod replication;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use hlc::{Hlc, HlcTimestamp};
pub use registry::{
    delta::{DeltaAction, DeltaRecord},
    expiry::SweepReport,
    governor::{GovernorReport, GovernorSettings, GovernorState},
    instance::{Application, Instance, InstanceAddress, InstanceKey, InstanceStatus},
    query::{DeltaBatch, RegistrySnapshot},
    store::ApplyOutcome,
    ReconcileReport, Registry, RegistryConfig,
};
pub use replication::{
    peer::{PeerHealth, PeerNode, PeerSet},
    replicator::{PeerWorker, ReplicationSettings, Replicator},
    PeerTransport,
};

/// Identity of a registry node, stamped on every delta it originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Config(format!("invalid node id {s:?}: {e}")))
    }
}
