/// evaluator.rs — Combination Evaluator (C6, spec §4.6)
///
/// Accepts a set of `Candidate`s and returns at most one `ClosureDecision`.
/// This is the single authoritative gate: every invariant in spec §4.6
/// (and therefore every property in spec §8) is enforced here, not
/// scattered across the strategies that produced the candidates.
use std::collections::HashSet;

use ahash::AHashSet;

use crate::config::EngineConfig;
use crate::types::{Candidate, ClosureDecision, PositionId, PortfolioHealth, PortfolioSnapshot, Side};
use crate::zone::ZonePartition;

/// Balance score used by rule 4 (spec §4.6): `100 - 200 * imbalance`.
fn balance_score(buy: usize, sell: usize) -> f64 {
    let imbalance = (buy as i64 - sell as i64).unsigned_abs() as f64 / (buy + sell).max(1) as f64;
    100.0 - 200.0 * imbalance
}

/// Rule 4 — balance non-regression: simulate post-close counts and
/// compare the resulting balance score against the current one.
/// Exposed `pub` because the Hedge Pair Finder's combination search
/// (spec §4.5.e) must pre-screen against the same rule before it ever
/// reaches the evaluator.
pub fn balance_non_regression(snapshot: &PortfolioSnapshot, members: &[PositionId]) -> bool {
    let buy_total = snapshot.count_side(Side::Buy);
    let sell_total = snapshot.count_side(Side::Sell);

    let buy_closed = members
        .iter()
        .filter_map(|id| snapshot.positions.get(id))
        .filter(|p| p.side == Side::Buy)
        .count();
    let sell_closed = members.len() - buy_closed;

    let current = balance_score(buy_total, sell_total);
    if current >= 80.0 {
        return true;
    }

    let new_buy = buy_total.saturating_sub(buy_closed);
    let new_sell = sell_total.saturating_sub(sell_closed);
    let new_score = balance_score(new_buy, new_sell);

    new_score >= current || (current - new_score) <= 10.0
}

/// Rule 5 — zone safety: closing must not leave a lone, unpaired,
/// losing position alone in its zone.
fn zone_safety(
    snapshot: &PortfolioSnapshot,
    zones: &ZonePartition,
    zone_width: f64,
    members: &[PositionId],
) -> bool {
    let member_set: AHashSet<PositionId> = members.iter().copied().collect();
    let mut touched_zone_ids: AHashSet<crate::types::ZoneId> = AHashSet::new();
    for id in members {
        if let Some(p) = snapshot.positions.get(id) {
            touched_zone_ids.insert(zones.zone_of(p, zone_width));
        }
    }

    for zone_id in touched_zone_ids {
        let zone = match zones.zones.get(&zone_id) {
            Some(z) => z,
            None => continue,
        };
        let remaining: Vec<PositionId> = zone
            .buys
            .iter()
            .chain(zone.sells.iter())
            .copied()
            .filter(|id| !member_set.contains(id))
            .collect();
        if remaining.len() == 1 {
            let lone = remaining[0];
            let profitable = snapshot
                .positions
                .get(&lone)
                .map(|p| p.is_profitable())
                .unwrap_or(true);
            if !profitable {
                return false;
            }
        }
    }
    true
}

/// Rule 3 — no-loss-closure: a group with negative gross pnl must
/// contain at least one profitable position whose profit covers the
/// losses (i.e. the candidate's own `net_pnl` check already implies
/// this once cost is subtracted, but we check it explicitly and reject
/// all-losers outright per spec §4.6 rule 3 / §8 property 12).
fn has_profit_cover(snapshot: &PortfolioSnapshot, members: &[PositionId]) -> bool {
    let any_profitable = members
        .iter()
        .filter_map(|id| snapshot.positions.get(id))
        .any(|p| p.is_profitable());
    if !any_profitable {
        return false;
    }
    true
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub regime: crate::types::MarginRegime,
    pub health: PortfolioHealth,
    pub zone_width: f64,
}

/// Validate one candidate against spec §4.6's numbered rules.
pub fn validate(
    candidate: &Candidate,
    snapshot: &PortfolioSnapshot,
    pending_closure: &HashSet<PositionId>,
    zones: &ZonePartition,
    cfg: &EngineConfig,
    ctx: &EvaluationContext,
) -> bool {
    // Rule 1: members non-empty, exist, not pending.
    if candidate.members.is_empty() {
        return false;
    }
    if candidate
        .members
        .iter()
        .any(|id| !snapshot.positions.contains_key(id) || pending_closure.contains(id))
    {
        return false;
    }

    // Rule 2: net_pnl threshold, relaxed in emergency mode.
    let emergency = ctx.regime == crate::types::MarginRegime::Critical || ctx.health == PortfolioHealth::VeryPoor;
    let threshold = if emergency {
        cfg.emergency_min_net_profit
    } else {
        cfg.min_net_profit
    };
    if candidate.net_pnl() < threshold {
        return false;
    }

    // Rule 3: no-loss-closure invariant.
    if candidate.gross_pnl < 0.0 && !has_profit_cover(snapshot, &candidate.members) {
        return false;
    }
    // A group consisting solely of losing positions is always rejected,
    // even if (hypothetically) cost modeling made net_pnl positive.
    let all_losers = candidate
        .members
        .iter()
        .filter_map(|id| snapshot.positions.get(id))
        .all(|p| !p.is_profitable());
    if all_losers {
        return false;
    }

    // Rule 4: balance non-regression.
    if !balance_non_regression(snapshot, &candidate.members) {
        return false;
    }

    // Rule 5: zone safety.
    if !zone_safety(snapshot, zones, ctx.zone_width, &candidate.members) {
        return false;
    }

    true
}

/// Select the best candidate among those that validate, per spec §4.6's
/// selection rule: max `net_pnl`, ties by max `quality`, further ties by
/// smallest member count.
pub fn select_best(
    candidates: &[Candidate],
    snapshot: &PortfolioSnapshot,
    pending_closure: &HashSet<PositionId>,
    zones: &ZonePartition,
    cfg: &EngineConfig,
    ctx: &EvaluationContext,
) -> Option<ClosureDecision> {
    let mut valid: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| validate(c, snapshot, pending_closure, zones, cfg, ctx))
        .collect();

    valid.sort_by(|a, b| {
        b.net_pnl()
            .partial_cmp(&a.net_pnl())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.quality
                    .unwrap_or(0.0)
                    .partial_cmp(&a.quality.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.members.len().cmp(&b.members.len()))
    });

    valid.first().map(|best| ClosureDecision {
        should_close: true,
        members: best.members.clone(),
        method_label: best.method_label.clone(),
        net_pnl: best.net_pnl(),
        gross_pnl: best.gross_pnl,
        cost: best.cost,
        confidence: best.quality.unwrap_or(50.0).clamp(0.0, 100.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, MarginRegime, Position};
    use std::collections::HashMap;

    fn pos(id: i64, side: Side, open_price: f64, pnl: f64) -> Position {
        Position {
            id: PositionId(id),
            side,
            volume: 0.01,
            open_price,
            current_price: open_price,
            open_time: 0,
            unrealized_pnl: pnl,
            magic: 1,
        }
    }

    fn snapshot(positions: Vec<Position>) -> PortfolioSnapshot {
        let mut map = HashMap::new();
        for p in positions {
            map.insert(p.id, p);
        }
        PortfolioSnapshot {
            positions: map,
            account: Account {
                balance: 1000.0,
                equity: 1000.0,
                margin: 100.0,
                free_margin: 900.0,
                margin_level: 1000.0,
            },
            market_price: 1900.0,
            timestamp: 0,
        }
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext {
            regime: MarginRegime::Normal,
            health: PortfolioHealth::Good,
            zone_width: 3.0,
        }
    }

    #[test]
    fn all_loss_candidate_is_rejected() {
        let snap = snapshot(vec![pos(1, Side::Buy, 1900.0, -4.0), pos(2, Side::Buy, 1901.0, -6.0)]);
        let zones = ZonePartition::build(&snap, 3.0);
        let cfg = EngineConfig::default();
        let candidate = Candidate {
            members: vec![PositionId(1), PositionId(2)],
            gross_pnl: -10.0,
            cost: 1.0,
            quality: None,
            method_label: "t".into(),
        };
        assert!(!validate(&candidate, &snap, &HashSet::new(), &zones, &cfg, &ctx()));
    }

    #[test]
    fn profitable_pair_above_threshold_is_accepted() {
        let snap = snapshot(vec![pos(1, Side::Buy, 1900.0, 8.0), pos(2, Side::Sell, 1905.0, -3.0)]);
        let zones = ZonePartition::build(&snap, 3.0);
        let cfg = EngineConfig::default();
        let candidate = Candidate {
            members: vec![PositionId(1), PositionId(2)],
            gross_pnl: 5.0,
            cost: 0.33,
            quality: Some(60.0),
            method_label: "t".into(),
        };
        assert!(validate(&candidate, &snap, &HashSet::new(), &zones, &cfg, &ctx()));
    }

    #[test]
    fn pending_closure_member_rejects_candidate() {
        let snap = snapshot(vec![pos(1, Side::Buy, 1900.0, 8.0), pos(2, Side::Sell, 1905.0, -3.0)]);
        let zones = ZonePartition::build(&snap, 3.0);
        let cfg = EngineConfig::default();
        let candidate = Candidate {
            members: vec![PositionId(1), PositionId(2)],
            gross_pnl: 5.0,
            cost: 0.33,
            quality: None,
            method_label: "t".into(),
        };
        let mut pending = HashSet::new();
        pending.insert(PositionId(1));
        assert!(!validate(&candidate, &snap, &pending, &zones, &cfg, &ctx()));
    }

    #[test]
    fn emergency_mode_relaxes_threshold() {
        let snap = snapshot(vec![pos(1, Side::Buy, 1900.0, 8.0), pos(2, Side::Sell, 1905.0, -3.0)]);
        let zones = ZonePartition::build(&snap, 3.0);
        let cfg = EngineConfig::default();
        let candidate = Candidate {
            members: vec![PositionId(1), PositionId(2)],
            gross_pnl: 0.03,
            cost: 0.01, // net = 0.02, below 0.05 but above 0.01
            quality: None,
            method_label: "t".into(),
        };
        let normal_ctx = ctx();
        assert!(!validate(&candidate, &snap, &HashSet::new(), &zones, &cfg, &normal_ctx));

        let emergency_ctx = EvaluationContext {
            regime: MarginRegime::Critical,
            health: PortfolioHealth::Poor,
            zone_width: 3.0,
        };
        assert!(validate(&candidate, &snap, &HashSet::new(), &zones, &cfg, &emergency_ctx));
    }

    #[test]
    fn s4_balance_guard_rejects_collapsing_closure() {
        // 10 buys (+1 each), 1 sell (+50): closing everything collapses balance.
        let mut positions = Vec::new();
        for i in 0..10 {
            positions.push(pos(i, Side::Buy, 1900.0 + i as f64, 1.0));
        }
        positions.push(pos(100, Side::Sell, 1950.0, 50.0));
        let snap = snapshot(positions);
        let zones = ZonePartition::build(&snap, 3.0);

        let all_members: Vec<PositionId> = (0..10).map(PositionId).chain(std::iter::once(PositionId(100))).collect();
        assert!(!balance_non_regression(&snap, &all_members));

        // Closing the sell plus 2 buys keeps balance reasonable (8 buy, 0 sell vs prior 10 buy 1 sell: still collapses? check smaller)
        let smaller: Vec<PositionId> = vec![PositionId(100), PositionId(0), PositionId(1)];
        // current score: 10 vs 1 -> imbalance = 9/11 = 0.818 -> score = 100-163.6 = -63.6 (very unbalanced already)
        // so current < 80, and after closing all 3: 8 vs 0 -> imbalance=1 -> score=-100, which is worse by more than 10: rejected too.
        assert!(!balance_non_regression(&snap, &smaller));
    }

    #[test]
    fn select_best_prefers_higher_net_pnl() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1900.0, 8.0),
            pos(2, Side::Sell, 1905.0, -3.0),
            pos(3, Side::Buy, 1900.0, 20.0),
            pos(4, Side::Sell, 1905.0, -3.0),
        ]);
        let zones = ZonePartition::build(&snap, 3.0);
        let cfg = EngineConfig::default();
        let candidates = vec![
            Candidate {
                members: vec![PositionId(1), PositionId(2)],
                gross_pnl: 5.0,
                cost: 0.33,
                quality: Some(50.0),
                method_label: "a".into(),
            },
            Candidate {
                members: vec![PositionId(3), PositionId(4)],
                gross_pnl: 17.0,
                cost: 0.33,
                quality: Some(50.0),
                method_label: "b".into(),
            },
        ];
        let decision = select_best(&candidates, &snap, &HashSet::new(), &zones, &cfg, &ctx()).unwrap();
        assert_eq!(decision.method_label, "b");
    }
}
