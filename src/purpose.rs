/// purpose.rs — Purpose Classifier (C3, spec §4.3)
///
/// Assigns one `Purpose` to each position in three passes: a base
/// classification from the position's own state, a relationship pass
/// that links problem positions to helpers, and a market-intelligence
/// pass that can upgrade a position to `TrendFollower`/`HedgePosition`.
/// An emergency override escalates priority under margin distress.
///
/// Pure over `(PortfolioSnapshot, MarketContext, PortfolioContext)`; the
/// purpose-update cooldown (default 180s, spec §4.3) is honored by the
/// caller passing in `last_assigned_at` from the State Tracker's
/// `purpose_cache` rather than by any hidden state in this module.
use std::collections::{HashMap, HashSet};

use crate::config::EngineConfig;
use crate::types::{
    MarginRegime, MarketAlignment, MarketContext, Position, PositionId, PortfolioSnapshot, Purpose,
    PurposeKind, PurposePriority, Side,
};

/// Account-level facts the classifier needs beyond the snapshot itself.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioContext {
    pub margin_regime: MarginRegime,
}

/// Classify every position in the snapshot.
///
/// `last_assigned_at` maps position id to the tick timestamp its purpose
/// was last (re)computed; when `now - last_assigned_at <
/// purpose_update_cooldown_seconds` the previous `Purpose` is kept
/// as-is rather than recomputed, suppressing flapping across adjacent
/// ticks. Positions absent from the map are always classified fresh.
pub fn classify_all(
    snapshot: &PortfolioSnapshot,
    market: &MarketContext,
    portfolio: &PortfolioContext,
    cfg: &EngineConfig,
    now: i64,
    last_assigned_at: &HashMap<PositionId, i64>,
    previous: &HashMap<PositionId, Purpose>,
) -> HashMap<PositionId, Purpose> {
    let mut base: HashMap<PositionId, Purpose> = HashMap::new();
    for position in snapshot.positions.values() {
        if let Some(&assigned_at) = last_assigned_at.get(&position.id) {
            if now - assigned_at < cfg.purpose_update_cooldown_seconds {
                if let Some(prev) = previous.get(&position.id) {
                    base.insert(position.id, prev.clone());
                    continue;
                }
            }
        }
        base.insert(position.id, base_classification(position, cfg));
    }

    relationship_pass(snapshot, cfg, &mut base);
    market_pass(snapshot, market, cfg, &mut base);
    emergency_overrides(portfolio, &mut base);

    base
}

fn base_classification(position: &Position, cfg: &EngineConfig) -> Purpose {
    let pnl = position.unrealized_pnl;
    let distance_pips = position.distance_to_market() / crate::types::PIP_SIZE;

    if pnl < cfg.heavy_loss_threshold || distance_pips > 500.0 {
        return Purpose {
            kind: PurposeKind::ProblemPosition,
            priority: PurposePriority::Critical,
            confidence: 90.0,
            market_alignment: MarketAlignment::Neutral,
            helper_for: HashSet::new(),
            needs_help_from: HashSet::new(),
            balance_partner: None,
        };
    }

    if (cfg.heavy_loss_threshold..cfg.problem_loss_threshold).contains(&pnl) || distance_pips > 150.0
    {
        let priority = if distance_pips > 300.0 || pnl < cfg.heavy_loss_threshold / 2.0 {
            PurposePriority::High
        } else {
            PurposePriority::Medium
        };
        return Purpose {
            kind: PurposeKind::ProblemPosition,
            priority,
            confidence: 75.0,
            market_alignment: MarketAlignment::Neutral,
            helper_for: HashSet::new(),
            needs_help_from: HashSet::new(),
            balance_partner: None,
        };
    }

    if pnl > cfg.profit_take_threshold {
        let priority = if pnl > cfg.profit_take_threshold * 4.0 {
            PurposePriority::High
        } else {
            PurposePriority::Medium
        };
        return Purpose {
            kind: PurposeKind::ProfitTaker,
            priority,
            confidence: 80.0,
            market_alignment: MarketAlignment::Neutral,
            helper_for: HashSet::new(),
            needs_help_from: HashSet::new(),
            balance_partner: None,
        };
    }

    Purpose {
        kind: PurposeKind::BalanceKeeper,
        priority: PurposePriority::Low,
        confidence: 60.0,
        market_alignment: MarketAlignment::Neutral,
        helper_for: HashSet::new(),
        needs_help_from: HashSet::new(),
        balance_partner: None,
    }
}

fn is_problem(purpose: &Purpose) -> bool {
    matches!(purpose.kind, PurposeKind::ProblemPosition)
}

fn is_balance_keeper(purpose: &Purpose) -> bool {
    matches!(purpose.kind, PurposeKind::BalanceKeeper)
}

/// Similar-pnl tolerance for balance-partner pairing (spec §4.3 step 2;
/// matches the original `abs(profit_diff) < 10` cutoff).
const BALANCE_PARTNER_PNL_TOLERANCE: f64 = 10.0;

fn relationship_pass(
    snapshot: &PortfolioSnapshot,
    cfg: &EngineConfig,
    base: &mut HashMap<PositionId, Purpose>,
) {
    let max_distance = cfg.helper_distance_price_units();
    let ids: Vec<PositionId> = snapshot.positions.keys().copied().collect();

    for &id in &ids {
        let position = &snapshot.positions[&id];
        let problem_now = is_problem(&base[&id]);

        if !problem_now {
            let opposite_problems: HashSet<PositionId> = ids
                .iter()
                .filter(|&&other_id| other_id != id)
                .filter(|&&other_id| {
                    let other = &snapshot.positions[&other_id];
                    other.side == position.side.opposite()
                        && is_problem(&base[&other_id])
                        && price_distance(position, other) <= max_distance
                })
                .copied()
                .collect();

            if !opposite_problems.is_empty() {
                if let Some(p) = base.get_mut(&id) {
                    p.kind = PurposeKind::RecoveryHelper;
                    p.helper_for = opposite_problems;
                }
            }
        } else {
            let rescuers: HashSet<PositionId> = ids
                .iter()
                .filter(|&&other_id| other_id != id)
                .filter(|&&other_id| {
                    let other = &snapshot.positions[&other_id];
                    other.side == position.side.opposite()
                        && other.is_profitable()
                        && price_distance(position, other) <= max_distance
                })
                .copied()
                .collect();

            if let Some(p) = base.get_mut(&id) {
                p.needs_help_from = rescuers;
            }
        }

        // Balance keepers with an opposite-side partner of similar pnl:
        // record `balance_partner`, picking the candidate whose open price
        // is closest to this position's own (spec §4.3 step 2).
        if is_balance_keeper(&base[&id]) {
            let partner = ids
                .iter()
                .filter(|&&other_id| other_id != id)
                .filter(|&&other_id| {
                    let other = &snapshot.positions[&other_id];
                    other.side == position.side.opposite()
                        && (other.unrealized_pnl - position.unrealized_pnl).abs()
                            < BALANCE_PARTNER_PNL_TOLERANCE
                })
                .min_by(|&&a_id, &&b_id| {
                    let a = &snapshot.positions[&a_id];
                    let b = &snapshot.positions[&b_id];
                    (a.open_price - position.open_price)
                        .abs()
                        .partial_cmp(&(b.open_price - position.open_price).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied();

            if let Some(p) = base.get_mut(&id) {
                p.balance_partner = partner;
            }
        }
    }
}

fn price_distance(a: &Position, b: &Position) -> f64 {
    (a.current_price - b.current_price).abs()
}

fn market_pass(
    snapshot: &PortfolioSnapshot,
    market: &MarketContext,
    cfg: &EngineConfig,
    base: &mut HashMap<PositionId, Purpose>,
) {
    for position in snapshot.positions.values() {
        let alignment = alignment_for(position.side, market);
        if let Some(p) = base.get_mut(&position.id) {
            p.market_alignment = alignment;

            let strongly_with = matches!(alignment, MarketAlignment::With | MarketAlignment::StrongWith);
            if market.strength > cfg.trend_follow_min_strength && strongly_with && position.is_profitable()
            {
                p.kind = PurposeKind::TrendFollower;
                continue;
            }

            let counter_trend = matches!(alignment, MarketAlignment::Against | MarketAlignment::StrongAgainst);
            let near_breakeven = position.unrealized_pnl.abs() < 2.0;
            if market.volatility > 70.0 && counter_trend && near_breakeven {
                p.kind = PurposeKind::HedgePosition;
            }
        }
    }
}

fn alignment_for(side: Side, market: &MarketContext) -> MarketAlignment {
    use crate::types::TrendDirection::*;
    match (side, market.direction) {
        (Side::Buy, Bull) | (Side::Sell, Bear) => {
            if market.strength > 80.0 {
                MarketAlignment::StrongWith
            } else {
                MarketAlignment::With
            }
        }
        (Side::Buy, Bear) | (Side::Sell, Bull) => {
            if market.strength > 80.0 {
                MarketAlignment::StrongAgainst
            } else {
                MarketAlignment::Against
            }
        }
        (_, Sideways) => MarketAlignment::Neutral,
    }
}

fn emergency_overrides(portfolio: &PortfolioContext, base: &mut HashMap<PositionId, Purpose>) {
    if portfolio.margin_regime != MarginRegime::Critical {
        return;
    }
    for purpose in base.values_mut() {
        if matches!(purpose.kind, PurposeKind::RecoveryHelper | PurposeKind::ProfitTaker) {
            purpose.priority = PurposePriority::Critical;
        }
    }
}
