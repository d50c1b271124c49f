// Full-registry and incremental delta views served to clients

use super::delta::{DeltaAction, DeltaRecord};
use super::instance::{Application, Instance, InstanceStatus};
use super::Registry;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Last delta sequence reflected in `instances`
    pub sequence: u64,
    pub registry_hash: String,
    pub instances: Vec<Instance>,
}

impl RegistrySnapshot {
    pub fn new(sequence: u64, mut instances: Vec<Instance>) -> Self {
        instances.sort_by(|a, b| {
            (a.service_name.as_str(), a.instance_id.as_str())
                .cmp(&(b.service_name.as_str(), b.instance_id.as_str()))
        });
        let registry_hash = registry_hash(&status_counts(&instances));
        Self {
            sequence,
            registry_hash,
            instances,
        }
    }

    pub fn applications(&self) -> Vec<Application> {
        Application::group(&self.instances)
    }

    /// Apply a delta batch the way a caching client would.
    ///
    /// Records at or below the snapshot's sequence are skipped; REGISTER,
    /// RENEW and STATUS_CHANGE upsert the carried instance, CANCEL and EXPIRE
    /// remove it.
    pub fn replay(&mut self, records: &[DeltaRecord]) {
        let mut by_key: BTreeMap<(String, String), Instance> = self
            .instances
            .drain(..)
            .map(|i| ((i.service_name.clone(), i.instance_id.clone()), i))
            .collect();

        let base = self.sequence;
        for record in records.iter().filter(|r| r.sequence > base) {
            let key = (
                record.instance.service_name.clone(),
                record.instance.instance_id.clone(),
            );
            match record.action {
                DeltaAction::Register | DeltaAction::Renew | DeltaAction::StatusChange => {
                    by_key.insert(key, record.instance.clone());
                }
                DeltaAction::Cancel | DeltaAction::Expire => {
                    by_key.remove(&key);
                }
            }
            self.sequence = record.sequence;
        }

        *self = Self::new(self.sequence, by_key.into_values().collect());
    }
}

/// Incremental changes after a client's cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub since: u64,
    pub latest_sequence: u64,
    /// Hash of the full registry after these records, for client verification
    pub registry_hash: String,
    pub records: Vec<DeltaRecord>,
}

/// Status-count reconciliation hash, e.g. `DOWN_1_UP_3_`.
///
/// A client that applied a delta compares its own hash with the server's;
/// a mismatch means it drifted and should fetch the full registry.
pub fn registry_hash(counts: &BTreeMap<InstanceStatus, usize>) -> String {
    let mut parts: Vec<(&str, usize)> = counts
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(status, n)| (status.as_str(), *n))
        .collect();
    parts.sort_unstable();

    parts
        .into_iter()
        .map(|(status, n)| format!("{status}_{n}_"))
        .collect()
}

fn status_counts(instances: &[Instance]) -> BTreeMap<InstanceStatus, usize> {
    let mut counts = BTreeMap::new();
    for instance in instances {
        *counts.entry(instance.status).or_insert(0) += 1;
    }
    counts
}

impl Registry {
    /// The whole registry. Always succeeds.
    pub fn full_registry(&self) -> RegistrySnapshot {
        self.store.snapshot()
    }

    /// Records after `since`, or `StaleCursor` when the client must re-fetch
    /// the full registry
    pub fn delta(&self, since: u64) -> Result<DeltaBatch> {
        let (records, counts) = self.store.changes_since(since)?;
        let latest_sequence = records.last().map_or(since, |r| r.sequence);

        Ok(DeltaBatch {
            since,
            latest_sequence,
            registry_hash: registry_hash(&counts),
            records,
        })
    }

    pub fn application(&self, name: &str) -> Option<Application> {
        let instances = self.store.by_service(name);
        if instances.is_empty() {
            None
        } else {
            Some(Application {
                name: name.to_string(),
                instances,
            })
        }
    }
}
