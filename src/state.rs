/// state.rs — State Tracker (C8, spec §4.8)
///
/// Holds everything that must survive across ticks: live positions as
/// last observed, in-flight closures (the `pending_closure` lock),
/// cooldown timestamps, a bounded performance history, and the purpose
/// cache the classifier reads for its cooldown check. Single-writer:
/// only the orchestrator mutates this; concurrent readers (a metrics
/// endpoint, a report binary) use the `dashmap` maps directly.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use dashmap::{DashMap, DashSet};

use crate::types::{ClosureResult, PortfolioHealth, Position, PositionId, Purpose};

/// Capacity of the rolling performance-history ring buffer (SPEC_FULL.md §B.2).
const PERFORMANCE_HISTORY_CAPACITY: usize = 100;

/// One closed-group outcome retained for the rolling health score.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub predicted_net_pnl: f64,
    pub realized_pnl: f64,
    pub fully_succeeded: bool,
    pub latency_ms: u64,
    pub timestamp: i64,
}

/// Rolling counters derived from `performance_history` (SPEC_FULL.md §B.2
/// / §C.8): `health_score = 0.4*success + 0.4*efficiency + 0.2*speed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthScore {
    pub success_score: f64,
    pub efficiency_score: f64,
    pub speed_score: f64,
    pub composite: f64,
    pub label: PortfolioHealth,
}

impl HealthScore {
    /// Exact formulas from SPEC_FULL.md §C.8: success/efficiency/speed
    /// sub-scores over the last `PERFORMANCE_HISTORY_CAPACITY` samples,
    /// composited 0.4/0.4/0.2 into a label.
    fn from_samples(samples: &VecDeque<PerformanceSample>, min_net_profit: f64, tick_budget_ms: u64) -> Self {
        if samples.is_empty() {
            return HealthScore {
                success_score: 100.0,
                efficiency_score: 100.0,
                speed_score: 100.0,
                composite: 100.0,
                label: PortfolioHealth::Good,
            };
        }
        let n = samples.len() as f64;
        let successes = samples.iter().filter(|s| s.fully_succeeded).count() as f64;
        let success_score = 100.0 * successes / n;

        let avg_net_pnl = samples.iter().map(|s| s.realized_pnl).sum::<f64>() / n;
        let efficiency_score = if min_net_profit > 0.0 {
            100.0 * (avg_net_pnl / min_net_profit).clamp(0.0, 1.0)
        } else {
            100.0
        };

        let avg_latency = samples.iter().map(|s| s.latency_ms as f64).sum::<f64>() / n;
        let speed_score = if tick_budget_ms > 0 {
            100.0 * (1.0 - avg_latency / tick_budget_ms as f64).clamp(0.0, 1.0)
        } else {
            100.0
        };

        let composite = 0.4 * success_score + 0.4 * efficiency_score + 0.2 * speed_score;
        let label = if composite >= 75.0 {
            PortfolioHealth::Good
        } else if composite >= 50.0 {
            PortfolioHealth::Fair
        } else if composite >= 25.0 {
            PortfolioHealth::Poor
        } else {
            PortfolioHealth::VeryPoor
        };

        HealthScore {
            success_score,
            efficiency_score,
            speed_score,
            composite,
            label,
        }
    }
}

/// Owned by the orchestrator; cloned `Arc`-free because the orchestrator
/// is the sole tick-loop driver. Internal maps are `dashmap` so a
/// read-only reporting surface (e.g. a metrics endpoint) can be handed a
/// `&StateTracker` reference safely without its own locking.
pub struct StateTracker {
    pub live_positions: DashMap<PositionId, Position>,
    pub pending_closure: DashSet<PositionId>,
    pub purpose_cache: DashMap<PositionId, Purpose>,
    pub purpose_assigned_at: DashMap<PositionId, i64>,
    /// Members of a closure that failed once and are being given one more
    /// tick of re-attempt before the Executor gives up on them (spec §4.7
    /// step 6). Presence here is what distinguishes "first failure, keep
    /// retrying" from "second failure, release and alert".
    retry_once: DashSet<PositionId>,
    last_closure_time: Mutex<Option<i64>>,
    performance_history: Mutex<VecDeque<PerformanceSample>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            live_positions: DashMap::new(),
            pending_closure: DashSet::new(),
            purpose_cache: DashMap::new(),
            purpose_assigned_at: DashMap::new(),
            retry_once: DashSet::new(),
            last_closure_time: Mutex::new(None),
            performance_history: Mutex::new(VecDeque::with_capacity(PERFORMANCE_HISTORY_CAPACITY)),
        }
    }

    /// Has `id` already been given its one extra tick of re-attempt
    /// (spec §4.7 step 6)? If so, this closure attempt is its last chance.
    pub fn had_prior_failure(&self, id: PositionId) -> bool {
        self.retry_once.contains(&id)
    }

    /// Record that `id` failed this tick and should get exactly one more
    /// tick before the Executor releases it with an operator alert.
    pub fn mark_retry_once(&self, id: PositionId) {
        self.retry_once.insert(id);
    }

    /// Clear the retry marker — either the member succeeded, or it has
    /// now exhausted its one extra re-attempt tick and is being released.
    pub fn clear_retry_once(&self, id: PositionId) {
        self.retry_once.remove(&id);
    }

    /// Refresh `live_positions` from a freshly-fetched broker snapshot,
    /// dropping anything no longer reported (closed externally, e.g. by
    /// stop-out) and releasing any lock held on it.
    pub fn sync_positions(&self, positions: &[Position]) {
        let incoming: HashSet<PositionId> = positions.iter().map(|p| p.id).collect();
        self.live_positions.retain(|id, _| incoming.contains(id));
        self.pending_closure.retain(|id| incoming.contains(id));
        self.retry_once.retain(|id| incoming.contains(id));
        for p in positions {
            self.live_positions.insert(p.id, p.clone());
        }
    }

    /// Snapshot of members currently mid-way through their one extra
    /// re-attempt tick (spec §4.7 step 6) — what the orchestrator
    /// reconciles on the following tick before running the search.
    pub fn retry_once_ids(&self) -> Vec<PositionId> {
        self.retry_once.iter().map(|id| *id).collect()
    }

    pub fn mark_pending(&self, members: &[PositionId]) {
        for id in members {
            self.pending_closure.insert(*id);
        }
    }

    pub fn clear_pending(&self, members: &[PositionId]) {
        for id in members {
            self.pending_closure.remove(id);
        }
    }

    pub fn pending_snapshot(&self) -> HashSet<PositionId> {
        self.pending_closure.iter().map(|id| *id).collect()
    }

    pub fn is_in_cooldown(&self, now: i64, cooldown_seconds: i64) -> bool {
        match *self.last_closure_time.lock().unwrap() {
            Some(last) => now - last < cooldown_seconds,
            None => false,
        }
    }

    pub fn record_closure_time(&self, now: i64) {
        *self.last_closure_time.lock().unwrap() = Some(now);
    }

    /// Append a closure result to the bounded ring buffer, evicting the
    /// oldest sample once `PERFORMANCE_HISTORY_CAPACITY` is exceeded.
    pub fn record_outcome(&self, result: &ClosureResult, now: i64) {
        let mut history = self.performance_history.lock().unwrap();
        if history.len() >= PERFORMANCE_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(PerformanceSample {
            predicted_net_pnl: result.predicted_net_pnl,
            realized_pnl: result.realized_pnl,
            fully_succeeded: result.fully_succeeded,
            latency_ms: result.latency_ms,
            timestamp: now,
        });
    }

    pub fn health_score(&self, cfg: &crate::config::EngineConfig) -> HealthScore {
        let history = self.performance_history.lock().unwrap();
        HealthScore::from_samples(&history, cfg.min_net_profit, cfg.tick_budget_ms)
    }

    pub fn purpose_assignments(&self) -> (HashMap<PositionId, Purpose>, HashMap<PositionId, i64>) {
        let purposes = self
            .purpose_cache
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let assigned_at = self
            .purpose_assigned_at
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        (purposes, assigned_at)
    }

    pub fn store_purposes(&self, purposes: HashMap<PositionId, Purpose>, now: i64) {
        for (id, purpose) in purposes {
            let changed = self
                .purpose_cache
                .get(&id)
                .map(|existing| existing.kind != purpose.kind)
                .unwrap_or(true);
            self.purpose_cache.insert(id, purpose);
            if changed {
                self.purpose_assigned_at.insert(id, now);
            }
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn pos(id: i64) -> Position {
        Position {
            id: PositionId(id),
            side: Side::Buy,
            volume: 0.01,
            open_price: 1900.0,
            current_price: 1900.0,
            open_time: 0,
            unrealized_pnl: 1.0,
            magic: 1,
        }
    }

    #[test]
    fn sync_drops_externally_closed_positions() {
        let tracker = StateTracker::new();
        tracker.sync_positions(&[pos(1), pos(2)]);
        assert_eq!(tracker.live_positions.len(), 2);
        tracker.sync_positions(&[pos(1)]);
        assert_eq!(tracker.live_positions.len(), 1);
        assert!(tracker.live_positions.contains_key(&PositionId(1)));
    }

    #[test]
    fn pending_lock_round_trips() {
        let tracker = StateTracker::new();
        tracker.mark_pending(&[PositionId(1), PositionId(2)]);
        assert!(tracker.pending_closure.contains(&PositionId(1)));
        tracker.clear_pending(&[PositionId(1)]);
        assert!(!tracker.pending_closure.contains(&PositionId(1)));
        assert!(tracker.pending_closure.contains(&PositionId(2)));
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let tracker = StateTracker::new();
        tracker.record_closure_time(1000);
        assert!(tracker.is_in_cooldown(1010, 30));
        assert!(!tracker.is_in_cooldown(1031, 30));
    }

    #[test]
    fn history_ring_buffer_is_bounded() {
        let tracker = StateTracker::new();
        for i in 0..(PERFORMANCE_HISTORY_CAPACITY + 10) {
            tracker.record_outcome(
                &ClosureResult {
                    members: vec![PositionId(1)],
                    fully_succeeded: true,
                    realized_pnl: 1.0,
                    predicted_net_pnl: 1.0,
                    latency_ms: 50,
                    retried_members: vec![],
                    failed_members: vec![],
                },
                i as i64,
            );
        }
        let history = tracker.performance_history.lock().unwrap();
        assert_eq!(history.len(), PERFORMANCE_HISTORY_CAPACITY);
    }

    #[test]
    fn empty_history_reports_good_health() {
        let tracker = StateTracker::new();
        let cfg = crate::config::EngineConfig::default();
        assert_eq!(tracker.health_score(&cfg).label, PortfolioHealth::Good);
    }

    #[test]
    fn repeated_failures_degrade_health_label() {
        let tracker = StateTracker::new();
        for i in 0..20 {
            tracker.record_outcome(
                &ClosureResult {
                    members: vec![PositionId(1)],
                    fully_succeeded: false,
                    realized_pnl: -5.0,
                    predicted_net_pnl: 5.0,
                    latency_ms: 1500,
                    retried_members: vec![],
                    failed_members: vec![PositionId(1)],
                },
                i,
            );
        }
        let cfg = crate::config::EngineConfig::default();
        let score = tracker.health_score(&cfg);
        assert!(matches!(score.label, PortfolioHealth::Poor | PortfolioHealth::VeryPoor));
    }
}
