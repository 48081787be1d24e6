/// config.rs — Centralised configuration loaded from .env
///
/// All parameters consumed by the closure engine are defined here
/// (spec §6 configuration table). Loading happens once at startup;
/// every component borrows `&EngineConfig`. Out-of-range values are
/// clamped with a warning rather than rejected (spec §7).
use anyhow::Result;
use std::env;
use tracing::warn;

use crate::types::PIP_SIZE;

/// Cost model defaults (spec §4.1), per 0.01 lot, account-currency units.
pub const DEFAULT_COMMISSION_PER_STD_LOT: f64 = 0.30;
pub const DEFAULT_SLIPPAGE_PER_STD_LOT: f64 = 1.50;
pub const DEFAULT_BUFFER_PER_STD_LOT: f64 = 1.00;
pub const DEFAULT_SPREAD_POINTS: f64 = 1.50;
pub const POINT_VALUE: f64 = 1.0;
pub const LOT_STEP: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ── Instrument ───────────────────────────────────────────────────
    pub symbol: String,
    pub zone_width: f64,

    // ── Cost model (C1) ──────────────────────────────────────────────
    pub commission_per_std_lot: f64,
    pub slippage_per_std_lot: f64,
    pub buffer_per_std_lot: f64,
    pub default_spread_points: f64,

    // ── Closure acceptance (C6) ──────────────────────────────────────
    pub min_net_profit: f64,
    pub emergency_min_net_profit: f64,

    // ── Throttles (C7/C9) ─────────────────────────────────────────────
    pub closing_cooldown_seconds: i64,
    pub tick_budget_ms: u64,
    pub purpose_update_cooldown_seconds: i64,

    // ── Hedge pair finder (C5) ────────────────────────────────────────
    pub max_helpers: usize,
    pub helper_distance_max_pips: f64,
    pub worker_pool_size: usize,

    // ── Purpose classifier thresholds (C3) ────────────────────────────
    pub heavy_loss_threshold: f64,
    pub profit_take_threshold: f64,
    pub problem_loss_threshold: f64,
    pub trend_follow_min_strength: f64,

    // ── Broker envelope ────────────────────────────────────────────────
    pub broker_timeout_ms: u64,
    pub broker_retries: u32,

    // ── Magic-number filter ────────────────────────────────────────────
    pub magic: i64,
}

impl EngineConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env

        let mut cfg = Self {
            symbol: env::var("SYMBOL").unwrap_or_else(|_| "XAUUSD".into()),
            zone_width: parse_env("ZONE_WIDTH", 3.0)?,

            commission_per_std_lot: parse_env(
                "COMMISSION_PER_STD_LOT",
                DEFAULT_COMMISSION_PER_STD_LOT,
            )?,
            slippage_per_std_lot: parse_env("SLIPPAGE_PER_STD_LOT", DEFAULT_SLIPPAGE_PER_STD_LOT)?,
            buffer_per_std_lot: parse_env("BUFFER_PER_STD_LOT", DEFAULT_BUFFER_PER_STD_LOT)?,
            default_spread_points: parse_env("DEFAULT_SPREAD_POINTS", DEFAULT_SPREAD_POINTS)?,

            min_net_profit: parse_env("MIN_NET_PROFIT", 0.05)?,
            emergency_min_net_profit: parse_env("EMERGENCY_MIN_NET_PROFIT", 0.01)?,

            closing_cooldown_seconds: parse_env("CLOSING_COOLDOWN_SECONDS", 30i64)?,
            tick_budget_ms: parse_env("TICK_BUDGET_MS", 2000u64)?,
            purpose_update_cooldown_seconds: parse_env(
                "PURPOSE_UPDATE_COOLDOWN_SECONDS",
                180i64,
            )?,

            max_helpers: parse_env("MAX_HELPERS", 10usize)?,
            helper_distance_max_pips: parse_env("HELPER_DISTANCE_MAX_PIPS", 100.0)?,
            worker_pool_size: parse_env("WORKER_POOL_SIZE", 4usize)?,

            heavy_loss_threshold: parse_env("HEAVY_LOSS_THRESHOLD", -50.0)?,
            profit_take_threshold: parse_env("PROFIT_TAKE_THRESHOLD", 5.0)?,
            problem_loss_threshold: parse_env("PROBLEM_LOSS_THRESHOLD", -5.0)?,
            trend_follow_min_strength: parse_env("TREND_FOLLOW_MIN_STRENGTH", 65.0)?,

            broker_timeout_ms: parse_env("BROKER_TIMEOUT_MS", 5000u64)?,
            broker_retries: parse_env("BROKER_RETRIES", 3u32)?,

            magic: parse_env("MAGIC", 0i64)?,
        };
        cfg.clamp_to_valid_ranges();
        Ok(cfg)
    }

    /// `helper_distance_max` expressed in the crate's single price-unit
    /// convention (spec §9 / SPEC_FULL.md §C.0): gold pips are 0.1 price
    /// units, so 100 pips = 10.0 price units.
    pub fn helper_distance_price_units(&self) -> f64 {
        self.helper_distance_max_pips * PIP_SIZE
    }

    /// Clamp obviously-invalid values instead of crashing (spec §7
    /// "Configuration out of range").
    fn clamp_to_valid_ranges(&mut self) {
        if self.zone_width <= 0.0 {
            warn!(zone_width = self.zone_width, "zone_width <= 0, clamping to 3.0");
            self.zone_width = 3.0;
        }
        if self.min_net_profit < 0.0 {
            warn!(
                min_net_profit = self.min_net_profit,
                "min_net_profit < 0, clamping to 0.05"
            );
            self.min_net_profit = 0.05;
        }
        if self.emergency_min_net_profit < 0.0 || self.emergency_min_net_profit > self.min_net_profit
        {
            warn!(
                emergency_min_net_profit = self.emergency_min_net_profit,
                "emergency_min_net_profit out of range, clamping to 0.01"
            );
            self.emergency_min_net_profit = 0.01;
        }
        if self.closing_cooldown_seconds < 0 {
            warn!("closing_cooldown_seconds < 0, clamping to 30");
            self.closing_cooldown_seconds = 30;
        }
        if self.max_helpers == 0 {
            warn!("max_helpers == 0, clamping to 10");
            self.max_helpers = 10;
        }
        if self.worker_pool_size == 0 {
            warn!("worker_pool_size == 0, clamping to 2");
            self.worker_pool_size = 2;
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "XAUUSD".into(),
            zone_width: 3.0,
            commission_per_std_lot: DEFAULT_COMMISSION_PER_STD_LOT,
            slippage_per_std_lot: DEFAULT_SLIPPAGE_PER_STD_LOT,
            buffer_per_std_lot: DEFAULT_BUFFER_PER_STD_LOT,
            default_spread_points: DEFAULT_SPREAD_POINTS,
            min_net_profit: 0.05,
            emergency_min_net_profit: 0.01,
            closing_cooldown_seconds: 30,
            tick_budget_ms: 2000,
            purpose_update_cooldown_seconds: 180,
            max_helpers: 10,
            helper_distance_max_pips: 100.0,
            worker_pool_size: 4,
            heavy_loss_threshold: -50.0,
            profit_take_threshold: 5.0,
            problem_loss_threshold: -5.0,
            trend_follow_min_strength: 65.0,
            broker_timeout_ms: 5000,
            broker_retries: 3,
            magic: 0,
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}
