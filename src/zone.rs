/// zone.rs — Zone Partitioner (C4, spec §4.4)
///
/// Buckets positions into fixed-width price zones keyed on `open_price`
/// (not `current_price` — spec §3 invariant), and answers imbalance and
/// cross-zone-pairing queries used by the Hedge Pair Finder (C5).
use ahash::AHashMap;

use crate::types::{Position, PositionId, PortfolioSnapshot, Side, Zone, ZoneBalance, ZoneId};

/// Informational clustering flag (SPEC_FULL.md §B.3): not a hard gate,
/// just surfaced for observability on whether a zone's positions are
/// tightly clustered (all within one `zone_width`) or the zone is a
/// coarse catch-all for stragglers near its boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneHealth {
    Clustered,
    Dispersed,
}

pub struct ZonePartition {
    pub zones: AHashMap<ZoneId, Zone>,
}

impl ZonePartition {
    /// Partition every position in the snapshot by `open_price / zone_width`.
    pub fn build(snapshot: &PortfolioSnapshot, zone_width: f64) -> Self {
        let mut zones: AHashMap<ZoneId, Zone> = AHashMap::new();
        for position in snapshot.positions.values() {
            let id = zone_id_for(position, zone_width);
            let zone = zones.entry(id).or_insert_with(|| Zone {
                id,
                buys: Vec::new(),
                sells: Vec::new(),
            });
            match position.side {
                Side::Buy => zone.buys.push(position.id),
                Side::Sell => zone.sells.push(position.id),
            }
        }
        Self { zones }
    }

    pub fn zone_of(&self, position: &Position, zone_width: f64) -> ZoneId {
        zone_id_for(position, zone_width)
    }

    pub fn imbalanced_zones(&self) -> Vec<(&Zone, ZoneBalance)> {
        self.zones
            .values()
            .filter_map(|z| match z.balance() {
                ZoneBalance::Balanced => None,
                other => Some((z, other)),
            })
            .collect()
    }

    /// Zones holding exactly one position total (lone, single-side).
    pub fn lone_positions(&self) -> Vec<PositionId> {
        self.zones
            .values()
            .filter(|z| z.buys.len() + z.sells.len() == 1)
            .flat_map(|z| z.buys.iter().chain(z.sells.iter()).copied())
            .collect()
    }

    /// For a lone position, find the best-net opposite-side partner from
    /// *another* zone that is itself unpaired (cross-zone pairing, spec
    /// §4.5.c). `candidates` should already exclude the lone position
    /// itself and anything in `pending_closure`.
    pub fn cross_zone_partner<'a>(
        &self,
        lone: PositionId,
        snapshot: &'a PortfolioSnapshot,
        zone_width: f64,
    ) -> Option<&'a Position> {
        let lone_pos = snapshot.positions.get(&lone)?;
        let lone_zone = self.zone_of(lone_pos, zone_width);
        let want_side = lone_pos.side.opposite();

        let other_lone_ids: Vec<PositionId> = self
            .zones
            .values()
            .filter(|z| z.id != lone_zone)
            .filter(|z| z.buys.len() + z.sells.len() == 1)
            .flat_map(|z| z.buys.iter().chain(z.sells.iter()).copied())
            .collect();

        other_lone_ids
            .into_iter()
            .filter_map(|id| snapshot.positions.get(&id))
            .filter(|p| p.side == want_side)
            .max_by(|a, b| {
                a.unrealized_pnl
                    .partial_cmp(&b.unrealized_pnl)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    pub fn health_of(&self, zone_id: ZoneId, zone_width: f64) -> ZoneHealth {
        match self.zones.get(&zone_id) {
            Some(z) if (z.buys.len() + z.sells.len()) <= 1 => ZoneHealth::Dispersed,
            Some(_) if zone_width > 0.0 => ZoneHealth::Clustered,
            _ => ZoneHealth::Dispersed,
        }
    }
}

fn zone_id_for(position: &Position, zone_width: f64) -> ZoneId {
    ZoneId((position.open_price / zone_width).floor() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Account;
    use std::collections::HashMap as StdHashMap;

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
        let mut map = StdHashMap::new();
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

    #[test]
    fn every_position_lands_in_exactly_one_zone() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1900.0, 1.0),
            pos(2, Side::Sell, 1903.5, -1.0),
            pos(3, Side::Buy, 1910.0, 2.0),
        ]);
        let partition = ZonePartition::build(&snap, 3.0);
        let total: usize = partition.zones.values().map(|z| z.buys.len() + z.sells.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn imbalance_detection() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1900.0, 1.0),
            pos(2, Side::Buy, 1900.5, 1.0),
            pos(3, Side::Buy, 1901.0, 1.0),
            pos(4, Side::Sell, 1901.2, -1.0),
        ]);
        let partition = ZonePartition::build(&snap, 3.0);
        let imbalanced = partition.imbalanced_zones();
        assert_eq!(imbalanced.len(), 1);
        assert_eq!(imbalanced[0].1, ZoneBalance::BuyHeavy);
    }

    #[test]
    fn cross_zone_partner_picks_best_net_from_other_zone() {
        let snap = snapshot(vec![
            pos(1, Side::Buy, 1900.0, 1.0),   // lone in its zone
            pos(2, Side::Sell, 1920.0, 9.0),  // lone, far zone, best
            pos(3, Side::Sell, 1930.0, 3.0),  // lone, far zone, worse
        ]);
        let partition = ZonePartition::build(&snap, 3.0);
        let partner = partition
            .cross_zone_partner(PositionId(1), &snap, 3.0)
            .unwrap();
        assert_eq!(partner.id, PositionId(2));
    }
}
