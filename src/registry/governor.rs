// Self-preservation governor
//
// Compares the renewal rate actually observed over a sliding window with the
// rate the registered population should produce. When the ratio collapses the
// registry assumes a partition between itself and its clients and stops
// evicting, serving possibly-stale entries instead of emptying itself.

use crate::clock::duration_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernorState {
    Normal,
    ThresholdBreached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSettings {
    /// How often a healthy client is expected to renew
    pub renewal_interval: Duration,
    /// Minimum acceptable actual/expected renewal ratio
    pub threshold_ratio: f64,
    /// Width of the sliding window renewals are counted over
    pub rate_window: Duration,
    /// How long the ratio must stay healthy before evictions resume
    pub recovery_period: Duration,
    /// When false, evictions are never vetoed
    pub enabled: bool,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(30),
            threshold_ratio: 0.85,
            rate_window: Duration::from_secs(60),
            recovery_period: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Renewal counts bucketed per second over a sliding window.
#[derive(Debug)]
struct RenewalRate {
    window_secs: u64,
    /// (second, count), oldest first
    buckets: VecDeque<(u64, u64)>,
}

impl RenewalRate {
    fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            buckets: VecDeque::new(),
        }
    }

    fn record(&mut self, now_ms: u64) {
        let second = now_ms / 1000;
        match self.buckets.back_mut() {
            Some((s, count)) if *s == second => *count += 1,
            // Out-of-order stamps land in the newest bucket rather than reshuffling
            Some((s, count)) if *s > second => *count += 1,
            _ => self.buckets.push_back((second, 1)),
        }
        self.evict_old(second);
    }

    /// Renewals in the window ending at `now_ms`
    fn count(&mut self, now_ms: u64) -> u64 {
        self.evict_old(now_ms / 1000);
        self.buckets.iter().map(|(_, c)| c).sum()
    }

    fn evict_old(&mut self, current_second: u64) {
        let floor = current_second.saturating_sub(self.window_secs);
        while self.buckets.front().is_some_and(|(s, _)| *s <= floor) {
            self.buckets.pop_front();
        }
    }
}

#[derive(Debug)]
struct GovernorInner {
    state: GovernorState,
    rate: RenewalRate,
    /// When the ratio first looked healthy again while breached
    recovering_since: Option<u64>,
}

/// Outcome of one governor evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorReport {
    pub state: GovernorState,
    pub expected_renewals: f64,
    pub actual_renewals: u64,
    pub ratio: f64,
    /// Still filling the first window; no decision was taken
    pub warming_up: bool,
    /// The state changed during this evaluation
    pub transitioned: bool,
}

#[derive(Debug)]
pub struct SelfPreservation {
    settings: GovernorSettings,
    started_at_ms: u64,
    inner: Mutex<GovernorInner>,
}

impl SelfPreservation {
    pub fn new(settings: GovernorSettings, started_at_ms: u64) -> Self {
        let rate = RenewalRate::new(settings.rate_window);
        Self {
            settings,
            started_at_ms,
            inner: Mutex::new(GovernorInner {
                state: GovernorState::Normal,
                rate,
                recovering_since: None,
            }),
        }
    }

    pub fn record_renewal(&self, now_ms: u64) {
        self.inner.lock().rate.record(now_ms);
    }

    pub fn state(&self) -> GovernorState {
        self.inner.lock().state
    }

    pub fn allows_eviction(&self) -> bool {
        !self.settings.enabled || self.state() == GovernorState::Normal
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Expected renewals per window for `instance_count` well-behaved clients
    #[allow(clippy::cast_precision_loss)]
    pub fn expected_renewals(&self, instance_count: usize) -> f64 {
        let interval = self.settings.renewal_interval.as_secs_f64();
        if interval <= 0.0 {
            return 0.0;
        }
        instance_count as f64 * self.settings.rate_window.as_secs_f64() / interval
    }

    /// Re-assess the state for the current population and renewal history
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, now_ms: u64, instance_count: usize) -> GovernorReport {
        let expected = self.expected_renewals(instance_count);
        let mut inner = self.inner.lock();
        let actual = inner.rate.count(now_ms);
        let ratio = if expected > 0.0 {
            actual as f64 / expected
        } else {
            1.0
        };

        let warming_up =
            now_ms.saturating_sub(self.started_at_ms) < duration_ms(self.settings.rate_window);
        let before = inner.state;

        if self.settings.enabled && !warming_up {
            let healthy = ratio >= self.settings.threshold_ratio;
            match (inner.state, healthy) {
                (GovernorState::Normal, false) => {
                    inner.state = GovernorState::ThresholdBreached;
                    inner.recovering_since = None;
                }
                (GovernorState::ThresholdBreached, true) => {
                    let since = *inner.recovering_since.get_or_insert(now_ms);
                    if now_ms.saturating_sub(since) >= duration_ms(self.settings.recovery_period) {
                        inner.state = GovernorState::Normal;
                        inner.recovering_since = None;
                    }
                }
                (GovernorState::ThresholdBreached, false) => inner.recovering_since = None,
                (GovernorState::Normal, true) => {}
            }
        }

        GovernorReport {
            state: inner.state,
            expected_renewals: expected,
            actual_renewals: actual,
            ratio,
            warming_up,
            transitioned: inner.state != before,
        }
    }
}
