/// broker.rs — Collaborator boundaries (spec §6)
///
/// The closure engine never talks to a real broker directly: it depends
/// on three abstract collaborators — `BrokerGateway` (read positions,
/// submit closes), `MarketAnalyzer` (trend/volatility context), and
/// `ClosureObserver` (fan-out notification on executed/failed closures).
/// A real MT5 bridge is out of scope (spec §6 Non-goals); `PaperBroker`
/// is the in-process stand-in used by the two binaries and integration
/// tests, kept as a plain `impl` rather than a trait object internally.
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::{EngineError, MarketContext, Position, PositionId, Side};

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn fetch_positions(&self, magic: i64) -> Result<Vec<Position>, EngineError>;
    async fn close_position(&self, id: PositionId) -> Result<f64, EngineError>;
    async fn current_spread_points(&self) -> Result<f64, EngineError>;
    /// spec §6 `is_market_open`: the orchestrator skips the tick entirely
    /// (no positions refreshed, no analytics run) when this is false.
    async fn is_market_open(&self) -> Result<bool, EngineError>;
}

#[async_trait]
pub trait MarketAnalyzer: Send + Sync {
    async fn context(&self) -> Result<MarketContext, EngineError>;
}

/// Wire event shape for observers (SPEC_FULL.md §A, `ClosureDecision`/
/// `ClosureResult` serialized to JSON for an external dashboard or log
/// sink). `serde_json` round-trips this losslessly.
#[derive(Debug, Clone, Serialize)]
pub struct ClosureEvent {
    pub members: Vec<PositionId>,
    pub method_label: String,
    pub predicted_net_pnl: f64,
    pub realized_pnl: f64,
    pub fully_succeeded: bool,
    pub timestamp: i64,
}

pub trait ClosureObserver: Send + Sync {
    fn on_closure(&self, event: &ClosureEvent);
}

/// Observer that just logs via `tracing`; the default when no external
/// sink is configured.
pub struct LoggingObserver;

impl ClosureObserver for LoggingObserver {
    fn on_closure(&self, event: &ClosureEvent) {
        if event.fully_succeeded {
            info!(
                members = ?event.members,
                method = %event.method_label,
                predicted = event.predicted_net_pnl,
                realized = event.realized_pnl,
                "closure executed"
            );
        } else {
            warn!(
                members = ?event.members,
                method = %event.method_label,
                "closure partially failed"
            );
        }
    }
}

/// In-process broker stand-in: holds positions in a `DashMap`, fills
/// closes at the position's own `current_price` minus a fixed slip, and
/// never rejects an order. Good enough for `closure_report`/
/// `closure_daemon` demo runs and for exercising the executor's retry
/// path deterministically (`fail_next` forces one transient error).
pub struct PaperBroker {
    positions: DashMap<PositionId, Position>,
    next_id: AtomicI64,
    spread_points: f64,
    fail_next_n: std::sync::Mutex<u32>,
    market_open: std::sync::atomic::AtomicBool,
}

impl PaperBroker {
    pub fn new(spread_points: f64) -> Self {
        Self {
            positions: DashMap::new(),
            next_id: AtomicI64::new(1),
            spread_points,
            fail_next_n: std::sync::Mutex::new(0),
            market_open: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Simulate the market closing (weekend/holiday) for orchestrator
    /// tests of the `is_market_open` skip path.
    pub fn set_market_open(&self, open: bool) {
        self.market_open.store(open, Ordering::SeqCst);
    }

    pub fn seed(&self, side: Side, volume: f64, open_price: f64, current_price: f64, open_time: i64) -> PositionId {
        let id = PositionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.positions.insert(
            id,
            Position {
                id,
                side,
                volume,
                open_price,
                current_price,
                open_time,
                unrealized_pnl: (current_price - open_price) * 10.0
                    * if side == Side::Sell { -1.0 } else { 1.0 },
                magic: 0,
            },
        );
        id
    }

    /// Force the next `n` `close_position` calls to fail transiently,
    /// for exercising the executor's retry path in tests.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next_n.lock().unwrap() = n;
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn fetch_positions(&self, magic: i64) -> Result<Vec<Position>, EngineError> {
        Ok(self
            .positions
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| magic == 0 || p.magic == magic)
            .collect())
    }

    async fn close_position(&self, id: PositionId) -> Result<f64, EngineError> {
        {
            let mut remaining = self.fail_next_n.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::TransientBroker(format!(
                    "paper broker simulated transient failure for {id}"
                )));
            }
        }
        match self.positions.remove(&id) {
            Some((_, position)) => Ok(position.unrealized_pnl),
            None => Err(EngineError::StaleSnapshot(id)),
        }
    }

    async fn current_spread_points(&self) -> Result<f64, EngineError> {
        Ok(self.spread_points)
    }

    async fn is_market_open(&self) -> Result<bool, EngineError> {
        Ok(self.market_open.load(Ordering::SeqCst))
    }
}

/// Market analyzer that always reports the same neutral context;
/// real trend/volatility analytics are out of scope (spec §6).
pub struct NeutralMarketAnalyzer;

#[async_trait]
impl MarketAnalyzer for NeutralMarketAnalyzer {
    async fn context(&self) -> Result<MarketContext, EngineError> {
        Ok(MarketContext::default())
    }
}
