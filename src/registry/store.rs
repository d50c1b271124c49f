// Lease store - the in-memory table of registered instances
//
// Per-key linearizability comes from the dashmap entry lock: the map mutation
// and the delta append for one key happen while that entry is held. A shared
// commit gate lets any number of writers proceed in parallel while
// `snapshot()` takes it exclusively for the duration of the copy, so a
// snapshot never observes a mutation without its delta (or the reverse).

use super::delta::{DeltaAction, DeltaLog, DeltaRecord};
use super::instance::{Instance, InstanceKey, InstanceStatus};
use super::lease::{grace_window_ms, Lease};
use super::query::RegistrySnapshot;
use crate::clock::{duration_ms, Clock};
use crate::error::{Error, Result};
use crate::hlc::{Hlc, HlcTimestamp};
use crate::NodeId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseSettings {
    /// Used when a registration does not ask for a lease duration
    pub default_lease: Duration,
    pub grace_multiplier: f64,
}

/// Result of applying a peer's record or a reconciliation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Applied,
    Discarded,
}

#[derive(Debug, Clone)]
struct Registration {
    instance: Instance,
    lease: Lease,
}

/// Left behind by a cancel so delayed writes cannot resurrect the instance
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    at: HlcTimestamp,
    recorded_at_ms: u64,
}

#[derive(Debug)]
pub struct LeaseStore {
    node_id: NodeId,
    entries: DashMap<InstanceKey, Registration>,
    tombstones: DashMap<InstanceKey, Tombstone>,
    gate: RwLock<()>,
    delta: DeltaLog,
    hlc: Arc<Hlc>,
    clock: Arc<dyn Clock>,
    settings: LeaseSettings,
}

impl LeaseStore {
    pub fn new(
        node_id: NodeId,
        settings: LeaseSettings,
        delta: DeltaLog,
        hlc: Arc<Hlc>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_id,
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            gate: RwLock::new(()),
            delta,
            hlc,
            clock,
            settings,
        }
    }

    /// Insert or overwrite the instance and start a fresh lease.
    ///
    /// Re-registering keeps the original registration timestamp, so retries
    /// with an identical payload leave the same state behind.
    pub fn register(&self, mut instance: Instance) -> DeltaRecord {
        let _gate = self.gate.read();
        let now = self.clock.now_ms();
        let key = instance.key();

        if instance.lease_duration_secs == 0 {
            instance.lease_duration_secs = self.settings.default_lease.as_secs();
        }
        instance.last_renewal_timestamp = now;
        instance.registration_timestamp = now;

        // last_dirty is taken under the entry lock: per key, version order matches sequence order
        let record = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                instance.registration_timestamp = e.get().instance.registration_timestamp;
                instance.last_dirty = self.hlc.now();
                let record = self.append(DeltaAction::Register, &instance, self.node_id, now);
                e.insert(self.registration(instance, now));
                record
            }
            Entry::Vacant(e) => {
                instance.last_dirty = self.hlc.now();
                let record = self.append(DeltaAction::Register, &instance, self.node_id, now);
                e.insert(self.registration(instance, now));
                record
            }
        };
        self.tombstones.remove(&key);
        record
    }

    /// Extend the lease from now. Unknown instances must re-register.
    pub fn renew(&self, key: &InstanceKey) -> Result<DeltaRecord> {
        let _gate = self.gate.read();
        let now = self.clock.now_ms();

        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(&key.service, &key.instance_id))?;
        entry.lease.renew(now);
        entry.instance.last_renewal_timestamp = now;

        Ok(self.append(DeltaAction::Renew, &entry.instance, self.node_id, now))
    }

    /// Remove the instance. Absent instances are a no-op and yield no record.
    pub fn cancel(&self, key: &InstanceKey) -> Option<DeltaRecord> {
        let _gate = self.gate.read();
        let now = self.clock.now_ms();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(e) => {
                let record = self.append(DeltaAction::Cancel, &e.get().instance, self.node_id, now);
                self.bury(key, record.timestamp, now);
                e.remove();
                Some(record)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Change the status without touching the lease
    pub fn set_status(&self, key: &InstanceKey, status: InstanceStatus) -> Result<DeltaRecord> {
        let _gate = self.gate.read();
        let now = self.clock.now_ms();

        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(&key.service, &key.instance_id))?;
        entry.instance.status = status;
        entry.instance.last_dirty = self.hlc.now();

        Ok(self.append(DeltaAction::StatusChange, &entry.instance, self.node_id, now))
    }

    /// Remove the instance if its lease is still past the deadline.
    ///
    /// Re-checked under the entry lock, so a renewal that raced the sweep wins.
    pub fn expire(&self, key: &InstanceKey) -> Option<DeltaRecord> {
        let _gate = self.gate.read();
        let now = self.clock.now_ms();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(e) if e.get().lease.is_expired(now) => {
                let record = self.append(DeltaAction::Expire, &e.get().instance, self.node_id, now);
                e.remove();
                Some(record)
            }
            _ => None,
        }
    }

    /// Keys whose lease is past its deadline, oldest deadline first
    pub fn expired_keys(&self) -> Vec<InstanceKey> {
        let now = self.clock.now_ms();
        let mut expired: Vec<(u64, InstanceKey)> = self
            .entries
            .iter()
            .filter(|e| e.lease.is_expired(now))
            .map(|e| (e.lease.expiry_deadline, e.key().clone()))
            .collect();
        expired.sort();
        expired.into_iter().map(|(_, key)| key).collect()
    }

    /// Apply a mutation replicated from a peer, last-writer-wins on `last_dirty`.
    ///
    /// `allow_eviction` gates EXPIRE hints: the instance is only removed when
    /// the local lease agrees it is dead and the local governor permits it.
    pub fn apply_replicated(&self, record: &DeltaRecord, allow_eviction: bool) -> Result<ApplyOutcome> {
        // drift-check the carried version as well as the record stamp
        self.hlc.update(record.timestamp.max(record.instance.last_dirty))?;

        let _gate = self.gate.read();
        let now = self.clock.now_ms();
        let incoming = &record.instance;
        let key = incoming.key();

        let outcome = match record.action {
            DeltaAction::Register => match self.entries.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    if incoming.last_dirty < e.get().instance.last_dirty {
                        ApplyOutcome::Discarded
                    } else {
                        let mut instance = incoming.clone();
                        instance.registration_timestamp = e.get().instance.registration_timestamp;
                        self.adopt_occupied(&mut e, instance, DeltaAction::Register, record.origin, now)
                    }
                }
                Entry::Vacant(e) => {
                    self.adopt_vacant(e, incoming, DeltaAction::Register, record.origin, now)
                }
            },
            DeltaAction::Renew => match self.entries.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    let local = e.get().instance.last_dirty;
                    if incoming.last_dirty < local {
                        ApplyOutcome::Discarded
                    } else if incoming.last_dirty > local {
                        // the peer has a newer version we missed
                        self.adopt_occupied(&mut e, incoming.clone(), DeltaAction::Renew, record.origin, now)
                    } else {
                        let registration = e.get_mut();
                        registration.lease.renew(now);
                        registration.instance.last_renewal_timestamp = now;
                        self.append(DeltaAction::Renew, &registration.instance, record.origin, now);
                        ApplyOutcome::Applied
                    }
                }
                Entry::Vacant(e) => {
                    self.adopt_vacant(e, incoming, DeltaAction::Register, record.origin, now)
                }
            },
            DeltaAction::StatusChange => match self.entries.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    if incoming.last_dirty < e.get().instance.last_dirty {
                        ApplyOutcome::Discarded
                    } else {
                        let registration = e.get_mut();
                        let mut instance = incoming.clone();
                        instance.last_renewal_timestamp = registration.instance.last_renewal_timestamp;
                        instance.registration_timestamp = registration.instance.registration_timestamp;
                        registration.instance = instance;
                        self.append(DeltaAction::StatusChange, &registration.instance, record.origin, now);
                        ApplyOutcome::Applied
                    }
                }
                Entry::Vacant(e) => {
                    self.adopt_vacant(e, incoming, DeltaAction::Register, record.origin, now)
                }
            },
            DeltaAction::Cancel => {
                let outcome = match self.entries.entry(key.clone()) {
                    Entry::Occupied(e) if incoming.last_dirty >= e.get().instance.last_dirty => {
                        self.append(DeltaAction::Cancel, &e.get().instance, record.origin, now);
                        e.remove();
                        ApplyOutcome::Applied
                    }
                    _ => ApplyOutcome::Discarded,
                };
                if outcome == ApplyOutcome::Applied || !self.entries.contains_key(&key) {
                    self.bury(&key, record.timestamp, now);
                }
                outcome
            }
            DeltaAction::Expire => match self.entries.entry(key.clone()) {
                Entry::Occupied(e) if allow_eviction && e.get().lease.is_expired(now) => {
                    self.append(DeltaAction::Expire, &e.get().instance, record.origin, now);
                    e.remove();
                    ApplyOutcome::Applied
                }
                _ => ApplyOutcome::Discarded,
            },
        };

        Ok(outcome)
    }

    /// Merge one instance from a peer's full registry.
    ///
    /// Newer versions are adopted; an equal version with a later renewal only
    /// extends the lease. Entries whose lease already lapsed are skipped.
    pub fn merge(&self, incoming: &Instance) -> Result<ApplyOutcome> {
        let now = self.clock.now_ms();
        let peer_deadline = incoming
            .last_renewal_timestamp
            .saturating_add(grace_window_ms(incoming.lease_duration(), self.settings.grace_multiplier));
        if now > peer_deadline {
            return Ok(ApplyOutcome::Discarded);
        }

        self.hlc.update(incoming.last_dirty)?;

        let _gate = self.gate.read();
        let renewed_at = incoming.last_renewal_timestamp.min(now);
        let key = incoming.key();

        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                let local = &e.get().instance;
                if incoming.last_dirty > local.last_dirty {
                    let mut instance = incoming.clone();
                    instance.registration_timestamp = local.registration_timestamp;
                    instance.last_renewal_timestamp = renewed_at.max(local.last_renewal_timestamp);
                    let renewed_at = instance.last_renewal_timestamp;
                    self.append(DeltaAction::Register, &instance, self.node_id, now);
                    e.insert(self.registration(instance, renewed_at));
                    ApplyOutcome::Applied
                } else if incoming.last_dirty == local.last_dirty
                    && renewed_at > local.last_renewal_timestamp
                {
                    let registration = e.get_mut();
                    registration.lease.renew(renewed_at);
                    registration.instance.last_renewal_timestamp = renewed_at;
                    self.append(DeltaAction::Renew, &registration.instance, self.node_id, now);
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Discarded
                }
            }
            Entry::Vacant(e) => {
                if self.is_buried(&key, incoming.last_dirty) {
                    ApplyOutcome::Discarded
                } else {
                    let mut instance = incoming.clone();
                    instance.last_renewal_timestamp = renewed_at;
                    self.append(DeltaAction::Register, &instance, self.node_id, now);
                    e.insert(self.registration(instance, renewed_at));
                    ApplyOutcome::Applied
                }
            }
        };

        Ok(outcome)
    }

    /// Consistent point-in-time copy of every instance, with the sequence of
    /// the last delta it reflects
    pub fn snapshot(&self) -> RegistrySnapshot {
        let gate = self.gate.write();
        let instances: Vec<Instance> = self.entries.iter().map(|e| e.instance.clone()).collect();
        let sequence = self.delta.latest_sequence();
        drop(gate);

        RegistrySnapshot::new(sequence, instances)
    }

    /// Delta records after `since` together with the status counts of the
    /// state they lead to, read under the same exclusive gate as `snapshot()`
    pub fn changes_since(&self, since: u64) -> Result<(Vec<DeltaRecord>, BTreeMap<InstanceStatus, usize>)> {
        let _gate = self.gate.write();
        let records = self.delta.since(since)?;
        Ok((records, self.status_counts()))
    }

    pub fn get(&self, key: &InstanceKey) -> Option<Instance> {
        self.entries.get(key).map(|e| e.instance.clone())
    }

    pub fn lease(&self, key: &InstanceKey) -> Option<Lease> {
        self.entries.get(key).map(|e| e.lease.clone())
    }

    /// Instances of one service, ordered by instance id
    pub fn by_service(&self, service: &str) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .entries
            .iter()
            .filter(|e| e.key().service == service)
            .map(|e| e.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    pub fn status_counts(&self) -> BTreeMap<InstanceStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.instance.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn delta(&self) -> &DeltaLog {
        &self.delta
    }

    /// Drop deltas and tombstones older than the retention window
    pub fn prune(&self) -> (usize, usize) {
        let now = self.clock.now_ms();
        let dropped_deltas = self.delta.prune(now);

        let cutoff = now.saturating_sub(duration_ms(self.delta.retention()));
        let before = self.tombstones.len();
        self.tombstones.retain(|_, t| t.recorded_at_ms >= cutoff);
        (dropped_deltas, before - self.tombstones.len())
    }

    fn registration(&self, instance: Instance, renewed_at: u64) -> Registration {
        let lease = Lease::new(
            instance.key(),
            renewed_at,
            instance.lease_duration(),
            self.settings.grace_multiplier,
        );
        Registration { instance, lease }
    }

    fn adopt_occupied(
        &self,
        entry: &mut dashmap::mapref::entry::OccupiedEntry<'_, InstanceKey, Registration>,
        mut instance: Instance,
        action: DeltaAction,
        origin: NodeId,
        now: u64,
    ) -> ApplyOutcome {
        instance.last_renewal_timestamp = now;
        self.append(action, &instance, origin, now);
        entry.insert(self.registration(instance, now));
        ApplyOutcome::Applied
    }

    fn adopt_vacant(
        &self,
        entry: dashmap::mapref::entry::VacantEntry<'_, InstanceKey, Registration>,
        incoming: &Instance,
        action: DeltaAction,
        origin: NodeId,
        now: u64,
    ) -> ApplyOutcome {
        if self.is_buried(entry.key(), incoming.last_dirty) {
            return ApplyOutcome::Discarded;
        }
        let mut instance = incoming.clone();
        instance.last_renewal_timestamp = now;
        self.append(action, &instance, origin, now);
        entry.insert(self.registration(instance, now));
        ApplyOutcome::Applied
    }

    fn append(&self, action: DeltaAction, instance: &Instance, origin: NodeId, now: u64) -> DeltaRecord {
        self.delta
            .append(action, instance.clone(), self.hlc.now(), origin, now)
    }

    fn bury(&self, key: &InstanceKey, at: HlcTimestamp, now: u64) {
        let mut tombstone = self.tombstones.entry(key.clone()).or_insert(Tombstone {
            at,
            recorded_at_ms: now,
        });
        if at > tombstone.at {
            tombstone.at = at;
            tombstone.recorded_at_ms = now;
        }
    }

    fn is_buried(&self, key: &InstanceKey, version: HlcTimestamp) -> bool {
        self.tombstones.get(key).is_some_and(|t| t.at >= version)
    }
}
