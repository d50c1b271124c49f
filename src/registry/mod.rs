// Registry engine: lease store, expiry sweep, self-preservation and queries
//
// `Registry` is the explicitly owned handle that request handlers, the
// replicator and the background tasks share (behind an `Arc`).

pub mod delta;
pub mod expiry;
pub mod governor;
pub mod instance;
pub mod lease;
pub mod query;
pub mod store;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::NodeId;
use delta::{DeltaAction, DeltaLog, DeltaRecord, DEFAULT_DELTA_RETENTION};
use governor::{GovernorReport, GovernorSettings, GovernorState, SelfPreservation};
use instance::{Instance, InstanceKey, InstanceStatus, MAX_LEASE_DURATION};
use lease::{Lease, DEFAULT_LEASE_DURATION};
use parking_lot::Mutex;
use query::RegistrySnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use store::{ApplyOutcome, LeaseSettings, LeaseStore};
use tracing::{debug, info, warn};

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Lease granted when a registration does not ask for one
    pub default_lease: Duration,
    /// Scales every lease when computing its deadline
    pub grace_multiplier: f64,
    /// How long delta records and tombstones are kept
    pub delta_retention: Duration,
    pub governor: GovernorSettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_lease: DEFAULT_LEASE_DURATION,
            grace_multiplier: 1.0,
            delta_retention: DEFAULT_DELTA_RETENTION,
            governor: GovernorSettings::default(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_grace_multiplier(mut self, multiplier: f64) -> Self {
        self.grace_multiplier = multiplier;
        self
    }

    pub fn with_delta_retention(mut self, retention: Duration) -> Self {
        self.delta_retention = retention;
        self
    }

    pub fn with_governor(mut self, governor: GovernorSettings) -> Self {
        self.governor = governor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_lease.as_secs() == 0 || self.default_lease > MAX_LEASE_DURATION {
            return Err(Error::Config(format!(
                "default lease must be within 1..={}s",
                MAX_LEASE_DURATION.as_secs()
            )));
        }
        if !self.grace_multiplier.is_finite() || self.grace_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "grace multiplier must be at least 1.0, got {}",
                self.grace_multiplier
            )));
        }
        if self.delta_retention.is_zero() {
            return Err(Error::Config("delta retention must be positive".into()));
        }

        let g = &self.governor;
        if !(g.threshold_ratio > 0.0 && g.threshold_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "threshold ratio must be within (0, 1], got {}",
                g.threshold_ratio
            )));
        }
        if g.renewal_interval.is_zero() {
            return Err(Error::Config("renewal interval must be positive".into()));
        }
        if g.rate_window < Duration::from_secs(1) {
            return Err(Error::Config("rate window must be at least 1s".into()));
        }
        Ok(())
    }
}

/// Outcome of merging a peer's full registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub applied: usize,
    pub discarded: usize,
    /// Entries refused outright, e.g. for clock drift
    pub rejected: usize,
}

#[derive(Debug)]
pub struct Registry {
    node_id: NodeId,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    store: LeaseStore,
    governor: SelfPreservation,
    last_governor_report: Mutex<Option<GovernorReport>>,
    started_at_ms: u64,
}

impl Registry {
    pub fn new(node_id: NodeId, config: RegistryConfig) -> Result<Self> {
        Self::with_clock(node_id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(node_id: NodeId, config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let started_at_ms = clock.now_ms();
        let hlc = Arc::new(Hlc::with_clock(clock.clone()));
        let store = LeaseStore::new(
            node_id,
            LeaseSettings {
                default_lease: config.default_lease,
                grace_multiplier: config.grace_multiplier,
            },
            DeltaLog::new(config.delta_retention),
            hlc,
            clock.clone(),
        );
        let governor = SelfPreservation::new(config.governor.clone(), started_at_ms);

        Ok(Self {
            node_id,
            config,
            clock,
            store,
            governor,
            last_governor_report: Mutex::new(None),
            started_at_ms,
        })
    }

    /// Validate and register an instance. A missing lease duration takes the default.
    pub fn register(&self, mut instance: Instance) -> Result<DeltaRecord> {
        if instance.lease_duration_secs == 0 {
            instance.lease_duration_secs = self.config.default_lease.as_secs();
        }
        instance.validate()?;

        let record = self.store.register(instance);
        debug!(instance = %record.instance.key(), sequence = record.sequence, "Registered");
        Ok(record)
    }

    pub fn renew(&self, key: &InstanceKey) -> Result<DeltaRecord> {
        let record = self.store.renew(key)?;
        self.governor.record_renewal(record.recorded_at_ms);
        Ok(record)
    }

    pub fn cancel(&self, key: &InstanceKey) -> Option<DeltaRecord> {
        let record = self.store.cancel(key);
        if record.is_some() {
            debug!(instance = %key, "Cancelled");
        }
        record
    }

    pub fn set_status(&self, key: &InstanceKey, status: InstanceStatus) -> Result<DeltaRecord> {
        let record = self.store.set_status(key, status)?;
        debug!(instance = %key, %status, "Status changed");
        Ok(record)
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<Instance> {
        self.store.get(key)
    }

    pub fn lease(&self, key: &InstanceKey) -> Option<Lease> {
        self.store.lease(key)
    }

    /// Apply a record replicated from a peer. The caller must not forward it again.
    pub fn apply_peer(&self, record: &DeltaRecord) -> Result<ApplyOutcome> {
        record.instance.validate()?;

        let outcome = self
            .store
            .apply_replicated(record, self.governor.allows_eviction())?;
        if outcome == ApplyOutcome::Applied && record.action == DeltaAction::Renew {
            self.governor.record_renewal(self.clock.now_ms());
        }
        debug!(
            action = ?record.action,
            instance = %record.instance.key(),
            origin = %record.origin,
            ?outcome,
            "Applied peer record"
        );
        Ok(outcome)
    }

    /// Merge a peer's full registry. Local instances the peer lacks are kept.
    pub fn reconcile(&self, snapshot: &RegistrySnapshot) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for instance in &snapshot.instances {
            match instance.validate().and_then(|()| self.store.merge(instance)) {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Discarded) => report.discarded += 1,
                Err(e) => {
                    warn!(instance = %instance.key(), error = %e, "Rejected reconciliation entry");
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Re-assess self-preservation against the current population
    pub fn evaluate_governor(&self) -> GovernorReport {
        let report = self
            .governor
            .evaluate(self.clock.now_ms(), self.store.len());

        if report.transitioned {
            match report.state {
                GovernorState::ThresholdBreached => warn!(
                    actual = report.actual_renewals,
                    expected = report.expected_renewals,
                    ratio = report.ratio,
                    "Renewal threshold breached, suspending evictions"
                ),
                GovernorState::Normal => info!(
                    ratio = report.ratio,
                    "Renewal rate recovered, evictions resume"
                ),
            }
        }
        *self.last_governor_report.lock() = Some(report.clone());
        report
    }

    /// Most recent evaluation, without re-evaluating
    pub fn last_governor_report(&self) -> Option<GovernorReport> {
        self.last_governor_report.lock().clone()
    }

    pub fn governor_state(&self) -> GovernorState {
        self.governor.state()
    }

    /// Drop delta records and tombstones past retention
    pub fn prune(&self) -> (usize, usize) {
        let (deltas, tombstones) = self.store.prune();
        if deltas > 0 || tombstones > 0 {
            debug!(deltas, tombstones, "Pruned retention");
        }
        (deltas, tombstones)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.store.delta().latest_sequence()
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.clock.now_ms().saturating_sub(self.started_at_ms))
    }
}
