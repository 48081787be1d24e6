/// scorer.rs — Position Scorer (C2, spec §4.2)
///
/// Produces a 7-dimensional `PositionScore` per position, weighted by
/// the account's margin regime. Pure over `(PortfolioSnapshot,
/// MarginRegime)`; for large portfolios the per-position scoring fans
/// out across a bounded `rayon` pool (spec §5's worker pool) and the
/// merge step sorts the result by `total_score` descending.
use rayon::prelude::*;

use crate::types::{MarginRegime, Position, PositionId, PositionScore, PortfolioSnapshot, ScorePriority, Side};

/// Portfolios at or above this size are scored across the worker pool.
const PARALLEL_THRESHOLD: usize = 100;

struct Weights {
    profit: f64,
    balance: f64,
    recovery: f64,
    margin_impact: f64,
    correlation: f64,
    time: f64,
    volatility: f64,
}

impl Weights {
    fn for_regime(regime: MarginRegime) -> Self {
        match regime {
            MarginRegime::Critical => Weights {
                profit: 0.40,
                balance: 0.20,
                recovery: 0.15,
                margin_impact: 0.10,
                correlation: 0.08,
                time: 0.05,
                volatility: 0.02,
            },
            MarginRegime::High => Weights {
                profit: 0.35,
                balance: 0.25,
                recovery: 0.15,
                correlation: 0.10,
                margin_impact: 0.08,
                time: 0.05,
                volatility: 0.02,
            },
            MarginRegime::Normal => Weights {
                profit: 0.30,
                balance: 0.25,
                recovery: 0.20,
                correlation: 0.12,
                margin_impact: 0.08,
                time: 0.03,
                volatility: 0.02,
            },
        }
    }
}

fn profit_score(p: f64) -> f64 {
    if p > 5.0 {
        (50.0 + 5.0 * p).min(100.0)
    } else if p > 0.0 {
        20.0 * p
    } else if p > -10.0 {
        8.0 * p
    } else {
        (-80.0 + 2.0 * (p + 10.0)).max(-100.0)
    }
}

fn balance_score(position: &Position, snapshot: &PortfolioSnapshot) -> f64 {
    let opposite = snapshot.count_side(position.side.opposite()) as f64;
    let same = (snapshot.count_side(position.side) as f64).max(1.0);
    (50.0 * (opposite / same)).min(100.0)
}

fn margin_impact(position: &Position, total_volume: f64) -> f64 {
    if total_volume <= 0.0 {
        0.0
    } else {
        100.0 * position.volume / total_volume
    }
}

fn recovery_potential(p: f64) -> f64 {
    if p > 0.0 {
        20.0
    } else if p > -5.0 {
        80.0
    } else if p > -20.0 {
        40.0
    } else {
        10.0
    }
}

fn time_score(hold_secs: i64) -> f64 {
    let hours = hold_secs as f64 / 3600.0;
    if hours < 1.0 {
        90.0
    } else if hours < 6.0 {
        80.0
    } else if hours < 24.0 {
        60.0
    } else if hours < 72.0 {
        40.0
    } else {
        20.0
    }
}

fn correlation_score(position: &Position, snapshot: &PortfolioSnapshot) -> f64 {
    let same = snapshot.count_side(position.side);
    let opposite = snapshot.count_side(position.side.opposite());
    if opposite == 0 {
        30.0
    } else if same < opposite {
        80.0
    } else {
        50.0
    }
}

fn volatility_score(abs_pnl: f64) -> f64 {
    if abs_pnl < 2.0 {
        90.0
    } else if abs_pnl < 10.0 {
        70.0
    } else if abs_pnl < 30.0 {
        50.0
    } else {
        30.0
    }
}

/// Score one position in isolation (used by both the serial and
/// parallel paths, and directly by tests).
pub fn score_position(
    position: &Position,
    snapshot: &PortfolioSnapshot,
    regime: MarginRegime,
    now: i64,
) -> PositionScore {
    let w = Weights::for_regime(regime);
    let total_volume = snapshot.total_volume();

    let profit = profit_score(position.unrealized_pnl);
    let balance = balance_score(position, snapshot);
    let margin = margin_impact(position, total_volume);
    let recovery = recovery_potential(position.unrealized_pnl);
    let time = time_score(position.hold_duration_secs(now));
    let correlation = correlation_score(position, snapshot);
    let volatility = volatility_score(position.unrealized_pnl.abs());

    let total = w.profit * profit
        + w.balance * balance
        + w.recovery * recovery
        + w.margin_impact * margin
        + w.correlation * correlation
        + w.time * time
        + w.volatility * volatility;

    PositionScore {
        profit_score: profit,
        balance_score: balance,
        margin_impact: margin,
        recovery_potential: recovery,
        time_score: time,
        correlation_score: correlation,
        volatility_score: volatility,
        total_score: total,
        priority: ScorePriority::from_total_score(total),
    }
}

/// Score every position in the snapshot. Returned list is sorted by
/// `total_score` descending (spec §4.2 contract).
pub fn score_all(
    snapshot: &PortfolioSnapshot,
    regime: MarginRegime,
    now: i64,
) -> Vec<(PositionId, PositionScore)> {
    let positions: Vec<&Position> = snapshot.positions.values().collect();

    let mut scored: Vec<(PositionId, PositionScore)> = if positions.len() >= PARALLEL_THRESHOLD {
        positions
            .par_iter()
            .map(|p| (p.id, score_position(p, snapshot, regime, now)))
            .collect()
    } else {
        positions
            .iter()
            .map(|p| (p.id, score_position(p, snapshot, regime, now)))
            .collect()
    };

    scored.sort_by(|a, b| {
        b.1.total_score
            .partial_cmp(&a.1.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pos(id: i64, side: Side, pnl: f64, volume: f64, open_time: i64) -> Position {
        Position {
            id: PositionId(id),
            side,
            volume,
            open_price: 1900.0,
            current_price: 1900.0 + pnl / 10.0,
            open_time,
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
            account: crate::types::Account {
                balance: 1000.0,
                equity: 1000.0,
                margin: 100.0,
                free_margin: 900.0,
                margin_level: 1000.0,
            },
            market_price: 1900.0,
            timestamp: 1_000_000,
        }
    }

    #[test]
    fn profitable_position_scores_must_close_when_big_enough() {
        let snap = snapshot(vec![pos(1, Side::Buy, 20.0, 0.01, 1_000_000)]);
        let score = score_position(
            snap.positions.get(&PositionId(1)).unwrap(),
            &snap,
            MarginRegime::Normal,
            1_000_000,
        );
        assert!(score.total_score > 30.0, "total = {}", score.total_score);
    }

    #[test]
    fn heavy_loser_scores_low() {
        let snap = snapshot(vec![pos(1, Side::Buy, -50.0, 0.01, 1_000_000)]);
        let score = score_position(
            snap.positions.get(&PositionId(1)).unwrap(),
            &snap,
            MarginRegime::Normal,
            1_000_000,
        );
        assert!(score.profit_score <= -80.0);
    }

    #[test]
    fn score_all_is_sorted_descending() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, -20.0, 0.01, 1_000_000),
            pos(2, Side::Sell, 15.0, 0.01, 1_000_000),
            pos(3, Side::Buy, 2.0, 0.01, 1_000_000),
        ]);
        let scored = score_all(&snap, MarginRegime::Normal, 1_000_000);
        for w in scored.windows(2) {
            assert!(w[0].1.total_score >= w[1].1.total_score);
        }
    }

    #[test]
    fn identical_inputs_yield_identical_scores() {
        let snap = snapshot(vec![pos(1, Side::Buy, 3.0, 0.02, 999_000)]);
        let a = score_all(&snap, MarginRegime::High, 1_000_000);
        let b = score_all(&snap, MarginRegime::High, 1_000_000);
        assert_eq!(a[0].1.total_score, b[0].1.total_score);
    }

    #[test]
    fn correlation_score_is_30_when_side_is_alone() {
        // No opposite-side positions at all -> this position's side is
        // "alone" (spec §4.2), not the degenerate same==0 case.
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1.0, 0.01, 1_000_000),
            pos(2, Side::Buy, 2.0, 0.01, 1_000_000),
        ]);
        let score = score_position(
            snap.positions.get(&PositionId(1)).unwrap(),
            &snap,
            MarginRegime::Normal,
            1_000_000,
        );
        assert_eq!(score.correlation_score, 30.0);
    }

    #[test]
    fn correlation_score_is_80_when_side_is_minority() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1.0, 0.01, 1_000_000),
            pos(2, Side::Sell, 2.0, 0.01, 1_000_000),
            pos(3, Side::Sell, 3.0, 0.01, 1_000_000),
        ]);
        let score = score_position(
            snap.positions.get(&PositionId(1)).unwrap(),
            &snap,
            MarginRegime::Normal,
            1_000_000,
        );
        assert_eq!(score.correlation_score, 80.0);
    }
}
