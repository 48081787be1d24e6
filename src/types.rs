/// types.rs — Core data model (spec §3)
///
/// Positions, scores, purposes, zones, candidates and the read-only
/// per-tick snapshot the rest of the engine operates on. Nothing in this
/// module performs I/O; everything here is a plain value.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque broker-assigned position identifier (an MT5 ticket number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionId(pub i64);

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// One open broker order (spec §3 Position).
///
/// `volume`/`open_price` are immutable for the life of the position;
/// `current_price`/`unrealized_pnl` are refreshed from the broker each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub open_time: i64,
    pub unrealized_pnl: f64,
    pub magic: i64,
}

impl Position {
    pub fn distance_to_market(&self) -> f64 {
        (self.current_price - self.open_price).abs()
    }

    pub fn is_profitable(&self) -> bool {
        self.unrealized_pnl > 0.0
    }

    pub fn hold_duration_secs(&self, now: i64) -> i64 {
        (now - self.open_time).max(0)
    }
}

/// Gold's pip size in raw price units. `helper_distance_max` (100 pips,
/// spec §6) is expressed in price units as `100.0 * PIP_SIZE`. See
/// SPEC_FULL.md §C.0 for why this single constant fixes the price-unit
/// ambiguity flagged in spec §9.
pub const PIP_SIZE: f64 = 0.1;

// ── Position Scorer (C2) ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScorePriority {
    MustClose,
    ShouldClose,
    CanHold,
    MustHold,
}

impl ScorePriority {
    pub fn from_total_score(total: f64) -> Self {
        if total > 70.0 {
            ScorePriority::MustClose
        } else if total > 30.0 {
            ScorePriority::ShouldClose
        } else if total > -30.0 {
            ScorePriority::CanHold
        } else {
            ScorePriority::MustHold
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionScore {
    pub profit_score: f64,
    pub balance_score: f64,
    pub margin_impact: f64,
    pub recovery_potential: f64,
    pub time_score: f64,
    pub correlation_score: f64,
    pub volatility_score: f64,
    pub total_score: f64,
    pub priority: ScorePriority,
}

// ── Purpose Classifier (C3) ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurposeKind {
    RecoveryHelper,
    ProblemPosition,
    BalanceKeeper,
    ProfitTaker,
    TrendFollower,
    HedgePosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PurposePriority {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketAlignment {
    StrongAgainst,
    Against,
    Neutral,
    With,
    StrongWith,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purpose {
    pub kind: PurposeKind,
    pub priority: PurposePriority,
    pub confidence: f64,
    pub market_alignment: MarketAlignment,
    pub helper_for: HashSet<PositionId>,
    pub needs_help_from: HashSet<PositionId>,
    /// For a `BalanceKeeper`: the opposite-side position of similar pnl it
    /// pairs with, if any (spec §4.3 step 2).
    pub balance_partner: Option<PositionId>,
}

// ── Zone Partitioner (C4) ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub i64);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub buys: Vec<PositionId>,
    pub sells: Vec<PositionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneBalance {
    Balanced,
    BuyHeavy,
    SellHeavy,
}

impl Zone {
    pub fn balance(&self) -> ZoneBalance {
        let diff = self.buys.len() as i64 - self.sells.len() as i64;
        if diff.abs() <= 1 {
            ZoneBalance::Balanced
        } else if diff > 0 {
            ZoneBalance::BuyHeavy
        } else {
            ZoneBalance::SellHeavy
        }
    }
}

// ── Candidate / closure decision (C5/C6) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub members: Vec<PositionId>,
    pub gross_pnl: f64,
    pub cost: f64,
    pub quality: Option<f64>,
    pub method_label: String,
}

impl Candidate {
    pub fn net_pnl(&self) -> f64 {
        self.gross_pnl - self.cost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureDecision {
    pub should_close: bool,
    pub members: Vec<PositionId>,
    pub method_label: String,
    pub net_pnl: f64,
    pub gross_pnl: f64,
    pub cost: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureResult {
    pub members: Vec<PositionId>,
    pub fully_succeeded: bool,
    pub realized_pnl: f64,
    pub predicted_net_pnl: f64,
    pub latency_ms: u64,
    pub retried_members: Vec<PositionId>,
    pub failed_members: Vec<PositionId>,
}

// ── Account / snapshot / regimes ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Account {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginRegime {
    Critical,
    High,
    Normal,
}

impl MarginRegime {
    pub fn from_margin_level(margin_level: f64) -> Self {
        if margin_level < 150.0 {
            MarginRegime::Critical
        } else if margin_level < 300.0 {
            MarginRegime::High
        } else {
            MarginRegime::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortfolioHealth {
    VeryPoor,
    Poor,
    Fair,
    Good,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub spread_points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Bull,
    Bear,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Momentum {
    Strong,
    Moderate,
    Weak,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketContext {
    pub direction: TrendDirection,
    pub strength: f64,
    pub momentum: Momentum,
    pub volatility: f64,
}

impl Default for MarketContext {
    /// Neutral default used when no MarketAnalyzer collaborator is wired in (spec §6).
    fn default() -> Self {
        Self {
            direction: TrendDirection::Sideways,
            strength: 50.0,
            momentum: Momentum::Moderate,
            volatility: 50.0,
        }
    }
}

/// Read-only view the engine takes each tick (spec §3 PortfolioSnapshot).
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub positions: HashMap<PositionId, Position>,
    pub account: Account,
    pub market_price: f64,
    pub timestamp: i64,
}

impl PortfolioSnapshot {
    pub fn total_volume(&self) -> f64 {
        self.positions.values().map(|p| p.volume).sum()
    }

    pub fn count_side(&self, side: Side) -> usize {
        self.positions.values().filter(|p| p.side == side).count()
    }
}

/// Typed error surface crossing abstract component boundaries (spec §7/§9).
/// Components return `Result<T, EngineError>`; only the orchestrator
/// recovers from it.
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("transient broker error: {0}")]
    TransientBroker(String),
    #[error("stale snapshot: position {0} no longer exists on the broker")]
    StaleSnapshot(PositionId),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("wall-time budget overrun")]
    BudgetOverrun,
    #[error("market closed")]
    MarketClosed,
    #[error("configuration value out of range: {0}")]
    ConfigOutOfRange(String),
    #[error("internal error: {0}")]
    Internal(String),
}
