// Append-only log of registry mutations, retained for a bounded window

use super::instance::Instance;
use crate::clock::duration_ms;
use crate::error::{Error, Result};
use crate::hlc::HlcTimestamp;
use crate::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default retention of delta records (3 minutes)
pub const DEFAULT_DELTA_RETENTION: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaAction {
    Register,
    Renew,
    Cancel,
    StatusChange,
    Expire,
}

/// One registry mutation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Position in the log of the node that wrote this record
    pub sequence: u64,
    pub action: DeltaAction,
    /// Instance state after the mutation (before removal, for CANCEL/EXPIRE)
    pub instance: Instance,
    /// Logical time of the mutation
    pub timestamp: HlcTimestamp,
    /// Wall time (ms) the record was appended, drives retention
    pub recorded_at_ms: u64,
    /// Node that first accepted the mutation
    pub origin: NodeId,
}

#[derive(Debug)]
struct DeltaLogInner {
    records: VecDeque<DeltaRecord>,
    /// Last sequence handed out
    latest: u64,
    /// Highest sequence already dropped by retention
    pruned_through: u64,
}

/// The delta log. Sequence assignment and append happen under one lock, the
/// single global ordering point of the registry.
#[derive(Debug)]
pub struct DeltaLog {
    inner: Mutex<DeltaLogInner>,
    retention: Duration,
}

impl DeltaLog {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(DeltaLogInner {
                records: VecDeque::new(),
                latest: 0,
                pruned_through: 0,
            }),
            retention,
        }
    }

    pub fn append(
        &self,
        action: DeltaAction,
        instance: Instance,
        timestamp: HlcTimestamp,
        origin: NodeId,
        now_ms: u64,
    ) -> DeltaRecord {
        let mut inner = self.inner.lock();
        inner.latest += 1;
        let record = DeltaRecord {
            sequence: inner.latest,
            action,
            instance,
            timestamp,
            recorded_at_ms: now_ms,
            origin,
        };
        inner.records.push_back(record.clone());
        record
    }

    /// Records with sequence greater than `since`, in sequence order
    pub fn since(&self, since: u64) -> Result<Vec<DeltaRecord>> {
        let inner = self.inner.lock();

        if since < inner.pruned_through || since > inner.latest {
            return Err(Error::StaleCursor {
                since,
                oldest: inner.pruned_through,
                latest: inner.latest,
            });
        }

        // Sequences are contiguous, so the offset into the deque is direct.
        let skip = usize::try_from(since - inner.pruned_through).unwrap_or(usize::MAX);
        Ok(inner.records.iter().skip(skip).cloned().collect())
    }

    pub fn latest_sequence(&self) -> u64 {
        self.inner.lock().latest
    }

    /// Oldest cursor still accepted by [`since`](Self::since)
    pub fn oldest_cursor(&self) -> u64 {
        self.inner.lock().pruned_through
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records older than the retention window. Returns how many were dropped.
    pub fn prune(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(duration_ms(self.retention));
        let mut inner = self.inner.lock();
        let mut dropped = 0;

        while inner
            .records
            .front()
            .is_some_and(|r| r.recorded_at_ms < cutoff)
        {
            if let Some(record) = inner.records.pop_front() {
                inner.pruned_through = record.sequence;
                dropped += 1;
            }
        }
        dropped
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}
