// Lease bookkeeping for a registered instance

use super::instance::InstanceKey;
use crate::clock::duration_ms;
use std::time::Duration;

/// Default lease duration when a registration does not ask for one (90 seconds)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(90);

/// Time-bounded claim that an instance is alive
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub key: InstanceKey,

    /// Wall time (ms) of the last renewal
    pub last_renewal: u64,

    pub duration: Duration,

    /// Scales `duration` when computing the deadline
    pub grace_multiplier: f64,

    /// Wall time (ms) after which the lease is expired
    pub expiry_deadline: u64,

    /// Number of times renewed
    pub renewal_count: u64,
}

impl Lease {
    pub fn new(key: InstanceKey, now: u64, duration: Duration, grace_multiplier: f64) -> Self {
        let mut lease = Self {
            key,
            last_renewal: now,
            duration,
            grace_multiplier,
            expiry_deadline: now,
            renewal_count: 0,
        };
        lease.expiry_deadline = lease.deadline_from(now);
        lease
    }

    /// Extend the lease from `now`
    pub fn renew(&mut self, now: u64) {
        self.last_renewal = now;
        self.expiry_deadline = self.deadline_from(now);
        self.renewal_count += 1;
    }

    /// A lease renewed exactly at its deadline is still alive; only strictly later is expired
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiry_deadline
    }

    pub fn time_remaining(&self, now: u64) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            Some(Duration::from_millis(self.expiry_deadline - now))
        }
    }

    fn deadline_from(&self, from: u64) -> u64 {
        from.saturating_add(grace_window_ms(self.duration, self.grace_multiplier))
    }
}

/// `duration × multiplier` in milliseconds
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn grace_window_ms(duration: Duration, multiplier: f64) -> u64 {
    (duration_ms(duration) as f64 * multiplier.max(0.0)).round() as u64
}
