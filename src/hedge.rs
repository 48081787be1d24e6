/// hedge.rs — Hedge Pair Finder (C5, spec §4.5)
///
/// The combinatorial core. Produces `Candidate` groups via five
/// strategies, tried in the order spec §4.5 lists them, stopping as soon
/// as a strategy yields at least one locally-viable candidate (net_pnl
/// above `min_net_profit`). Final admission (all of spec §4.6's
/// invariants) is the Combination Evaluator's job, not this module's —
/// this module only needs enough of a local check to know when to stop
/// searching.
use std::collections::HashSet;
use std::time::Instant;

use ahash::AHashSet;
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::cost::estimate_cost;
use crate::evaluator::balance_non_regression;
use crate::types::{Candidate, Position, PositionId, PositionScore, PortfolioHealth, PortfolioSnapshot, Side};
use crate::zone::ZonePartition;

/// Performance-tuning profile selected per tick (spec §4.5 + SPEC_FULL.md §C.5).
#[derive(Debug, Clone, Copy)]
pub struct TuningProfile {
    pub max_analyze: usize,
    pub max_enumerations: usize,
    pub parallel: bool,
}

impl TuningProfile {
    pub fn select(position_count: usize, health: PortfolioHealth) -> Self {
        let mut profile = if position_count <= 20 {
            TuningProfile {
                max_analyze: position_count,
                max_enumerations: 200,
                parallel: false,
            }
        } else if position_count <= 60 {
            TuningProfile {
                max_analyze: 40,
                max_enumerations: 150,
                parallel: true,
            }
        } else {
            TuningProfile {
                max_analyze: 50,
                max_enumerations: 100,
                parallel: true,
            }
        };

        match health {
            PortfolioHealth::Poor | PortfolioHealth::VeryPoor => {
                profile.max_enumerations = (profile.max_enumerations as f64 * 1.5) as usize;
            }
            PortfolioHealth::Good => {
                profile.max_enumerations = (profile.max_enumerations as f64 * 0.75) as usize;
            }
            PortfolioHealth::Fair => {}
        }
        profile
    }
}

pub struct FinderInputs<'a> {
    pub snapshot: &'a PortfolioSnapshot,
    pub scores: &'a std::collections::HashMap<PositionId, PositionScore>,
    pub zones: &'a ZonePartition,
    pub pending_closure: &'a HashSet<PositionId>,
    pub cfg: &'a EngineConfig,
    pub health: PortfolioHealth,
    pub regime: crate::types::MarginRegime,
    pub deadline: Instant,
}

/// Run strategies (a)-(e) in order, returning every locally-viable
/// candidate found by the first strategy to produce one (spec §4.5).
/// If every strategy is exhausted without a viable candidate, returns
/// whatever best-so-far candidates were produced (possibly empty).
pub fn find_candidates(inputs: &FinderInputs) -> Vec<Candidate> {
    let profile = TuningProfile::select(inputs.snapshot.positions.len(), inputs.health);

    let strategies: [fn(&FinderInputs, &TuningProfile) -> Vec<Candidate>; 5] = [
        furthest_first_targeting,
        opposite_side_pairs,
        cross_zone_pairing,
        multi_helper_from_worst_loser,
        intelligent_combination_search,
    ];

    let mut best_so_far: Vec<Candidate> = Vec::new();
    for strategy in strategies {
        if Instant::now() >= inputs.deadline {
            break;
        }
        let found = strategy(inputs, &profile);
        let (viable, rest): (Vec<Candidate>, Vec<Candidate>) =
            found.into_iter().partition(|c| locally_viable(c, inputs));
        if !viable.is_empty() {
            return viable;
        }
        // keep the biggest net_pnl candidate seen so far, viable or not,
        // in case every strategy comes up empty (spec §4.9 "best-so-far").
        best_so_far.extend(rest);
    }
    best_so_far.sort_by(|a, b| b.net_pnl().partial_cmp(&a.net_pnl()).unwrap_or(std::cmp::Ordering::Equal));
    best_so_far
}

fn locally_viable(c: &Candidate, inputs: &FinderInputs) -> bool {
    let threshold = if inputs.regime == crate::types::MarginRegime::Critical
        || inputs.health == PortfolioHealth::VeryPoor
    {
        inputs.cfg.emergency_min_net_profit
    } else {
        inputs.cfg.min_net_profit
    };
    c.net_pnl() >= threshold
}

fn is_eligible(id: PositionId, inputs: &FinderInputs) -> bool {
    !inputs.pending_closure.contains(&id)
}

fn group_volume(members: &[PositionId], snapshot: &PortfolioSnapshot) -> f64 {
    members
        .iter()
        .filter_map(|id| snapshot.positions.get(id))
        .map(|p| p.volume)
        .sum()
}

fn group_gross(members: &[PositionId], snapshot: &PortfolioSnapshot) -> f64 {
    members
        .iter()
        .filter_map(|id| snapshot.positions.get(id))
        .map(|p| p.unrealized_pnl)
        .sum()
}

/// Average 7D `total_score` over `members` (spec §3 `Candidate.quality`,
/// used by the evaluator's tie-break, spec §4.6 selection rule).
fn average_quality(
    members: &[PositionId],
    scores: &std::collections::HashMap<PositionId, PositionScore>,
) -> Option<f64> {
    if members.is_empty() {
        return None;
    }
    let sum: f64 = members.iter().filter_map(|id| scores.get(id)).map(|s| s.total_score).sum();
    let counted = members.iter().filter(|id| scores.contains_key(id)).count();
    if counted == 0 {
        None
    } else {
        Some(sum / counted as f64)
    }
}

fn make_candidate(
    members: Vec<PositionId>,
    snapshot: &PortfolioSnapshot,
    scores: &std::collections::HashMap<PositionId, PositionScore>,
    cfg: &EngineConfig,
    label: &str,
) -> Candidate {
    let gross = group_gross(&members, snapshot);
    let volume = group_volume(&members, snapshot);
    let cost = estimate_cost(volume, None, cfg);
    let quality = average_quality(&members, scores);
    Candidate {
        members,
        gross_pnl: gross,
        cost,
        quality,
        method_label: label.to_string(),
    }
}

// ── (a) Furthest-first targeting ────────────────────────────────────────

fn furthest_first_targeting(inputs: &FinderInputs, _profile: &TuningProfile) -> Vec<Candidate> {
    let snapshot = inputs.snapshot;
    let mut by_distance: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| is_eligible(p.id, inputs))
        .collect();
    by_distance.sort_by(|a, b| {
        b.distance_to_market()
            .partial_cmp(&a.distance_to_market())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut targets: Vec<&Position> = by_distance.iter().take(3).copied().collect();
    for p in by_distance.iter().skip(3) {
        if p.distance_to_market() >= inputs.cfg.zone_width {
            targets.push(p);
        }
    }

    let mut candidates = Vec::new();
    for target in targets {
        if target.is_profitable() {
            candidates.push(make_candidate(
                vec![target.id],
                snapshot,
                inputs.scores,
                inputs.cfg,
                "furthest_first_single",
            ));
        } else if let Some(combo) = smart_hedge_combination(target.id, inputs) {
            candidates.push(combo);
        }
    }
    candidates
}

/// Search for a combination that turns a losing target into a profitable
/// closure (spec §4.5.a "smart hedge combination"). Delegates to the
/// same greedy multi-helper augmentation as strategy (d).
fn smart_hedge_combination(target: PositionId, inputs: &FinderInputs) -> Option<Candidate> {
    augment_with_helpers(vec![target], inputs, "furthest_first_smart_hedge")
}

// ── (b) Opposite-side pair enumeration ──────────────────────────────────

fn opposite_side_pairs(inputs: &FinderInputs, _profile: &TuningProfile) -> Vec<Candidate> {
    let snapshot = inputs.snapshot;
    let buys: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| p.side == Side::Buy && is_eligible(p.id, inputs))
        .collect();
    let sells: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| p.side == Side::Sell && is_eligible(p.id, inputs))
        .collect();

    let mut candidates = Vec::new();
    for buy in &buys {
        for sell in &sells {
            let members = vec![buy.id, sell.id];
            let candidate = make_candidate(members, snapshot, inputs.scores, inputs.cfg, "opposite_pair");
            if candidate.net_pnl() >= inputs.cfg.min_net_profit {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

// ── (c) Cross-zone pairing ──────────────────────────────────────────────

const CROSS_ZONE_MIN_NET: f64 = 2.0;

fn cross_zone_pairing(inputs: &FinderInputs, _profile: &TuningProfile) -> Vec<Candidate> {
    let snapshot = inputs.snapshot;
    let lone = inputs.zones.lone_positions();
    let mut candidates = Vec::new();
    let mut used: AHashSet<PositionId> = AHashSet::new();

    for lone_id in lone {
        if used.contains(&lone_id) || !is_eligible(lone_id, inputs) {
            continue;
        }
        if let Some(partner) = inputs
            .zones
            .cross_zone_partner(lone_id, snapshot, inputs.cfg.zone_width)
        {
            if used.contains(&partner.id) || !is_eligible(partner.id, inputs) {
                continue;
            }
            let candidate = make_candidate(vec![lone_id, partner.id], snapshot, inputs.scores, inputs.cfg, "cross_zone_pair");
            if candidate.net_pnl() >= CROSS_ZONE_MIN_NET {
                used.insert(lone_id);
                used.insert(partner.id);
                candidates.push(candidate);
            }
        }
    }
    candidates
}

// ── (d) Multi-helper augmentation ───────────────────────────────────────

fn multi_helper_from_worst_loser(inputs: &FinderInputs, _profile: &TuningProfile) -> Vec<Candidate> {
    let snapshot = inputs.snapshot;
    let worst_loser = snapshot
        .positions
        .values()
        .filter(|p| is_eligible(p.id, inputs) && !p.is_profitable())
        .min_by(|a, b| {
            a.unrealized_pnl
                .partial_cmp(&b.unrealized_pnl)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    match worst_loser {
        Some(loser) => augment_with_helpers(vec![loser.id], inputs, "multi_helper_augmentation")
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

/// Greedily add profitable helpers (descending profit) to `base`, up to
/// `max_helpers`, accepting each addition only if it strictly improves
/// `net_pnl`; early-exits once `net_pnl >= 1.2 * min_net_profit`.
fn augment_with_helpers(base: Vec<PositionId>, inputs: &FinderInputs, label: &str) -> Option<Candidate> {
    let snapshot = inputs.snapshot;
    let mut members = base;
    let mut helpers: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| is_eligible(p.id, inputs) && p.is_profitable() && !members.contains(&p.id))
        .collect();
    helpers.sort_by(|a, b| {
        b.unrealized_pnl
            .partial_cmp(&a.unrealized_pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut current = make_candidate(members.clone(), snapshot, inputs.scores, inputs.cfg, label);
    let early_exit_target = inputs.cfg.min_net_profit * 1.2;

    for helper in helpers {
        if members.len() >= inputs.cfg.max_helpers + 1 {
            break;
        }
        let mut trial = members.clone();
        trial.push(helper.id);
        let candidate = make_candidate(trial.clone(), snapshot, inputs.scores, inputs.cfg, label);
        if candidate.net_pnl() > current.net_pnl() {
            members = trial;
            current = candidate;
            if current.net_pnl() >= early_exit_target {
                break;
            }
        }
    }

    if members.len() > 1 {
        Some(current)
    } else {
        None
    }
}

// ── (e) Intelligent positive-combination search ─────────────────────────

fn intelligent_combination_search(inputs: &FinderInputs, profile: &TuningProfile) -> Vec<Candidate> {
    let snapshot = inputs.snapshot;
    let score_floor = if inputs.regime == crate::types::MarginRegime::Critical {
        60.0
    } else {
        70.0
    };

    let mut profitable: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| is_eligible(p.id, inputs) && p.is_profitable())
        .collect();
    let mut losing: Vec<&Position> = snapshot
        .positions
        .values()
        .filter(|p| is_eligible(p.id, inputs) && !p.is_profitable())
        .collect();

    sort_by_score_desc(&mut profitable, inputs.scores);
    sort_by_score_desc(&mut losing, inputs.scores);

    profitable.truncate(profile.max_analyze);
    losing.truncate(profile.max_analyze);

    let max_n = 30.min(profitable.len() + losing.len());
    if max_n < 2 {
        return Vec::new();
    }

    let splits: Vec<(usize, usize)> = (2..=max_n)
        .flat_map(|n| {
            (1..n).map(move |p| (p, n - p)).collect::<Vec<_>>()
        })
        .filter(|&(p, l)| p >= 1 && l >= 1)
        .take(profile.max_enumerations)
        .collect();

    let evaluate = |&(p, l): &(usize, usize)| -> Option<Candidate> {
        if p > profitable.len() || l > losing.len() {
            return None;
        }
        let mut members: Vec<PositionId> = profitable[..p].iter().map(|x| x.id).collect();
        members.extend(losing[..l].iter().map(|x| x.id));

        let candidate = make_candidate(members.clone(), snapshot, inputs.scores, inputs.cfg, "intelligent_combination");
        if candidate.net_pnl() <= 0.0 {
            return None;
        }

        let avg_score = members
            .iter()
            .filter_map(|id| inputs.scores.get(id))
            .map(|s| s.total_score)
            .sum::<f64>()
            / members.len() as f64;
        if avg_score < score_floor {
            return None;
        }

        if !balance_non_regression(snapshot, &members) {
            return None;
        }

        Some(candidate)
    };

    let mut results: Vec<Candidate> = if profile.parallel {
        splits.par_iter().filter_map(evaluate).collect()
    } else {
        splits.iter().filter_map(evaluate).collect()
    };

    results.sort_by(|a, b| b.net_pnl().partial_cmp(&a.net_pnl()).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(1);
    results
}

fn sort_by_score_desc(
    positions: &mut Vec<&Position>,
    scores: &std::collections::HashMap<PositionId, PositionScore>,
) {
    positions.sort_by(|a, b| {
        let sa = scores.get(&a.id).map(|s| s.total_score).unwrap_or(0.0);
        let sb = scores.get(&b.id).map(|s| s.total_score).unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::score_all;
    use crate::types::{Account, MarginRegime};
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

    fn snapshot(positions: Vec<Position>, margin_level: f64) -> PortfolioSnapshot {
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
                margin_level,
            },
            market_price: 1900.0,
            timestamp: 0,
        }
    }

    #[test]
    fn s1_simple_hedge_pair_is_found() {
        let snap = snapshot(
            vec![
                pos(1, Side::Buy, 1900.0, 8.00),
                pos(2, Side::Sell, 1905.0, -3.00),
            ],
            1000.0,
        );
        let cfg = EngineConfig::default();
        let zones = ZonePartition::build(&snap, cfg.zone_width);
        let scores: HashMap<_, _> = score_all(&snap, MarginRegime::Normal, 0).into_iter().collect();
        let pending = HashSet::new();
        let inputs = FinderInputs {
            snapshot: &snap,
            scores: &scores,
            zones: &zones,
            pending_closure: &pending,
            cfg: &cfg,
            health: PortfolioHealth::Good,
            regime: MarginRegime::Normal,
            deadline: Instant::now() + std::time::Duration::from_secs(5),
        };
        let candidates = find_candidates(&inputs);
        assert!(!candidates.is_empty());
        let best = candidates
            .iter()
            .max_by(|a, b| a.net_pnl().partial_cmp(&b.net_pnl()).unwrap())
            .unwrap();
        assert!(best.members.contains(&PositionId(1)));
        assert!(best.members.contains(&PositionId(2)));
        assert!((best.gross_pnl - 5.0).abs() < 1e-9);
    }

    #[test]
    fn s2_all_loss_portfolio_yields_no_viable_candidate() {
        let snap = snapshot(
            vec![pos(1, Side::Buy, 1900.0, -4.0), pos(2, Side::Buy, 1901.0, -6.0)],
            1000.0,
        );
        let cfg = EngineConfig::default();
        let zones = ZonePartition::build(&snap, cfg.zone_width);
        let scores: HashMap<_, _> = score_all(&snap, MarginRegime::Normal, 0).into_iter().collect();
        let pending = HashSet::new();
        let inputs = FinderInputs {
            snapshot: &snap,
            scores: &scores,
            zones: &zones,
            pending_closure: &pending,
            cfg: &cfg,
            health: PortfolioHealth::Good,
            regime: MarginRegime::Normal,
            deadline: Instant::now() + std::time::Duration::from_secs(5),
        };
        let candidates = find_candidates(&inputs);
        assert!(candidates.iter().all(|c| c.net_pnl() < cfg.min_net_profit));
    }

    #[test]
    fn s3_multi_helper_rescue_combination() {
        let snap = snapshot(
            vec![
                pos(1, Side::Buy, 1900.0, -12.0),
                pos(2, Side::Sell, 1901.0, 5.0),
                pos(3, Side::Sell, 1902.0, 9.0),
            ],
            1000.0,
        );
        let cfg = EngineConfig::default();
        let zones = ZonePartition::build(&snap, cfg.zone_width);
        let scores: HashMap<_, _> = score_all(&snap, MarginRegime::Normal, 0).into_iter().collect();
        let pending = HashSet::new();
        let inputs = FinderInputs {
            snapshot: &snap,
            scores: &scores,
            zones: &zones,
            pending_closure: &pending,
            cfg: &cfg,
            health: PortfolioHealth::Good,
            regime: MarginRegime::Normal,
            deadline: Instant::now() + std::time::Duration::from_secs(5),
        };
        let result = augment_with_helpers(vec![PositionId(1)], &inputs, "test");
        let candidate = result.expect("expected a rescuing combination");
        assert!(candidate.members.contains(&PositionId(1)));
        assert!(candidate.members.contains(&PositionId(2)));
        assert!(candidate.members.contains(&PositionId(3)));
        assert!(candidate.net_pnl() >= cfg.min_net_profit);
    }
}
