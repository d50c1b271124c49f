// Hybrid Logical Clock (HLC) implementation
// Based on: https://sookocheff.com/post/time/hybrid-logical-clocks/
//
// Instance versions (`last_dirty`) are HLC timestamps, so replicas can order
// writes from different nodes even when their wall clocks disagree slightly.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::sync::Arc;

/// Maximum clock drift allowed between nodes (in milliseconds)
/// Remote timestamps further in the future than this are refused
pub const MAX_CLOCK_DRIFT_MS: u64 = 60_000;

/// A Hybrid Logical Clock timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Physical time component (milliseconds since Unix epoch)
    pub physical: u64,
    /// Logical counter to break ties when physical time is equal
    pub logical: u32,
}

impl HlcTimestamp {
    pub fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.physical == 0 && self.logical == 0
    }

    /// Check if this timestamp is within acceptable drift of current time
    pub fn is_within_drift(&self, now_ms: u64) -> bool {
        self.physical <= now_ms || self.physical - now_ms <= MAX_CLOCK_DRIFT_MS
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.physical, self.logical)
    }
}

/// A Hybrid Logical Clock
#[derive(Debug)]
pub struct Hlc {
    clock: Arc<dyn Clock>,
    last: Mutex<HlcTimestamp>,
}

impl Hlc {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(HlcTimestamp::zero()),
        }
    }

    /// Generate a new timestamp, strictly greater than any issued or observed before
    pub fn now(&self) -> HlcTimestamp {
        let physical_now = self.clock.now_ms();
        let mut last = self.last.lock();

        let next = if physical_now > last.physical {
            HlcTimestamp::new(physical_now, 0)
        } else {
            HlcTimestamp::new(last.physical, last.logical + 1)
        };

        *last = next;
        next
    }

    /// Update the HLC with a timestamp received from another node
    /// Returns the new local timestamp after incorporating the remote one
    pub fn update(&self, remote: HlcTimestamp) -> Result<HlcTimestamp> {
        let physical_now = self.clock.now_ms();

        if !remote.is_within_drift(physical_now) {
            return Err(Error::ClockDrift {
                remote_physical: remote.physical,
                local_physical: physical_now,
                max_drift_ms: MAX_CLOCK_DRIFT_MS,
            });
        }

        let mut last = self.last.lock();
        let max_physical = cmp::max(cmp::max(physical_now, remote.physical), last.physical);

        let logical = if max_physical == last.physical && max_physical == remote.physical {
            cmp::max(last.logical, remote.logical) + 1
        } else if max_physical == last.physical {
            last.logical + 1
        } else if max_physical == remote.physical {
            remote.logical + 1
        } else {
            // Our physical time is ahead
            0
        };

        let next = HlcTimestamp::new(max_physical, logical);
        *last = next;
        Ok(next)
    }

    /// Get the last timestamp generated or received by this HLC
    pub fn last(&self) -> HlcTimestamp {
        *self.last.lock()
    }
}

impl Default for Hlc {
    fn default() -> Self {
        Self::new()
    }
}
