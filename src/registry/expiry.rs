// Expiry sweep, gated by the self-preservation governor

use super::delta::DeltaRecord;
use super::governor::GovernorState;
use super::Registry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// EXPIRE records for the instances removed by this sweep
    pub evicted: Vec<DeltaRecord>,
    /// Expired instances kept because the governor vetoed eviction
    pub suppressed: usize,
    pub governor_state: GovernorState,
}

impl Registry {
    /// Remove every instance whose lease is past its deadline, unless the
    /// governor currently suspends evictions.
    pub fn evict_expired(&self) -> SweepReport {
        let governor = self.evaluate_governor();
        let expired = self.store.expired_keys();

        if expired.is_empty() {
            return SweepReport {
                evicted: Vec::new(),
                suppressed: 0,
                governor_state: governor.state,
            };
        }

        if !self.governor.allows_eviction() {
            warn!(
                expired = expired.len(),
                ratio = governor.ratio,
                "Self-preservation active, keeping expired instances"
            );
            return SweepReport {
                evicted: Vec::new(),
                suppressed: expired.len(),
                governor_state: governor.state,
            };
        }

        let evicted: Vec<DeltaRecord> = expired
            .iter()
            .filter_map(|key| {
                let record = self.store.expire(key);
                if record.is_none() {
                    debug!(instance = %key, "Renewed during sweep, kept");
                }
                record
            })
            .collect();

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted expired instances");
        }

        SweepReport {
            evicted,
            suppressed: 0,
            governor_state: governor.state,
        }
    }
}
