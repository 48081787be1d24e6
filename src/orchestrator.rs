/// orchestrator.rs — Orchestrator (C9, spec §4.9)
///
/// The per-tick driver. Wires C1-C8 together: fetch positions, score,
/// classify purpose, partition zones, search for a closure candidate,
/// validate/select it, execute it — all under a wall-clock tick budget.
/// Single task, no interior concurrency beyond what the Scorer/Finder
/// spawn internally via `rayon`.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::broker::{BrokerGateway, ClosureObserver, MarketAnalyzer};
use crate::config::EngineConfig;
use crate::evaluator::{select_best, EvaluationContext};
use crate::executor::ClosureExecutor;
use crate::hedge::{find_candidates, FinderInputs};
use crate::purpose::{classify_all, PortfolioContext};
use crate::scorer::score_all;
use crate::state::StateTracker;
use crate::types::{EngineError, MarginRegime, PortfolioSnapshot};
use crate::zone::ZonePartition;

pub struct Orchestrator {
    broker: Arc<dyn BrokerGateway>,
    market: Arc<dyn MarketAnalyzer>,
    executor: ClosureExecutor,
    state: StateTracker,
    cfg: EngineConfig,
    last_market_closed_log: std::sync::Mutex<Option<i64>>,
}

/// Outcome of a single tick, returned for reporting/testing. Mirrors
/// what `closure_report` prints and what the daemon loop logs.
#[derive(Debug)]
pub enum TickOutcome {
    NoAction { reason: &'static str },
    Closed(crate::types::ClosureResult),
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        market: Arc<dyn MarketAnalyzer>,
        observer: Arc<dyn ClosureObserver>,
        cfg: EngineConfig,
    ) -> Self {
        let executor = ClosureExecutor::new(broker.clone(), observer);
        Self {
            broker,
            market,
            executor,
            state: StateTracker::new(),
            cfg,
            last_market_closed_log: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    /// Run exactly one tick, enforcing `cfg.tick_budget_ms` as a hard
    /// wall-clock ceiling on the search phase (spec §4.9).
    pub async fn tick(&self, now: i64) -> Result<TickOutcome, EngineError> {
        let tick_start = Instant::now();

        if !self.broker.is_market_open().await? {
            self.log_market_closed(now);
            return Ok(TickOutcome::NoAction { reason: "market closed" });
        }

        let positions = self.broker.fetch_positions(self.cfg.magic).await?;
        self.state.sync_positions(&positions);

        // Reconcile any members left pending from a prior tick's partial
        // failure (spec §4.7 step 6) before anything else. This is a
        // continuation of an already-decided closure, not a new closure
        // action, so it runs even during the closing cooldown.
        if !self.state.retry_once_ids().is_empty() {
            self.executor.reconcile_pending_retries(&self.state, &self.cfg, now).await;
        }

        if self.state.is_in_cooldown(now, self.cfg.closing_cooldown_seconds) {
            return Ok(TickOutcome::NoAction { reason: "cooldown active" });
        }

        if positions.is_empty() {
            return Ok(TickOutcome::NoAction { reason: "no open positions" });
        }

        let account = self.fetch_account_snapshot(&positions).await?;
        let market_price = positions.iter().map(|p| p.current_price).sum::<f64>() / positions.len() as f64;
        let snapshot = PortfolioSnapshot {
            positions: positions.into_iter().map(|p| (p.id, p)).collect(),
            account,
            market_price,
            timestamp: now,
        };

        let regime = MarginRegime::from_margin_level(snapshot.account.margin_level);
        let health = self.state.health_score(&self.cfg).label;
        let market = self.market.context().await?;

        let (previous_purposes, last_assigned_at) = self.state.purpose_assignments();
        let portfolio_ctx = PortfolioContext { margin_regime: regime };
        let purposes = classify_all(
            &snapshot,
            &market,
            &portfolio_ctx,
            &self.cfg,
            now,
            &last_assigned_at,
            &previous_purposes,
        );
        self.state.store_purposes(purposes, now);

        let scores: std::collections::HashMap<_, _> =
            score_all(&snapshot, regime, now).into_iter().collect();
        let zones = ZonePartition::build(&snapshot, self.cfg.zone_width);
        let pending = self.state.pending_snapshot();

        let deadline = tick_start + Duration::from_millis(self.cfg.tick_budget_ms);
        let finder_inputs = FinderInputs {
            snapshot: &snapshot,
            scores: &scores,
            zones: &zones,
            pending_closure: &pending,
            cfg: &self.cfg,
            health,
            regime,
            deadline,
        };
        let candidates = find_candidates(&finder_inputs);
        if Instant::now() >= deadline {
            warn!("tick wall-budget exceeded during candidate search");
        }

        let eval_ctx = EvaluationContext {
            regime,
            health,
            zone_width: self.cfg.zone_width,
        };
        let decision = select_best(&candidates, &snapshot, &pending, &zones, &self.cfg, &eval_ctx);

        match decision {
            Some(decision) => {
                info!(net_pnl = decision.net_pnl, method = %decision.method_label, "executing closure");
                let result = self.executor.execute(&decision, &self.state, &self.cfg, now).await?;
                Ok(TickOutcome::Closed(result))
            }
            None => Ok(TickOutcome::NoAction { reason: "no admissible candidate" }),
        }
    }

    /// Market-closed is expected and frequent (nights/weekends); spec §7
    /// asks for an info-level log at most once per minute rather than
    /// once per tick.
    fn log_market_closed(&self, now: i64) {
        let mut last = self.last_market_closed_log.lock().unwrap();
        if last.map_or(true, |t| now - t >= 60) {
            info!("market closed, skipping tick");
            *last = Some(now);
        }
    }

    /// Margin/account figures come bundled with the position fetch on a
    /// real MT5 bridge; the abstract `BrokerGateway` only exposes
    /// position/spread/close here, so we derive a synthetic account view
    /// from position state for anything this crate itself computes from
    /// (regime selection). A concrete broker implementation that has a
    /// richer account endpoint should override this by wrapping
    /// `BrokerGateway` rather than this orchestrator needing to change.
    async fn fetch_account_snapshot(
        &self,
        positions: &[crate::types::Position],
    ) -> Result<crate::types::Account, EngineError> {
        let margin: f64 = positions.iter().map(|p| p.volume * 1000.0).sum();
        let equity: f64 = 1000.0 + positions.iter().map(|p| p.unrealized_pnl).sum::<f64>();
        let margin_level = if margin > 0.0 { 100.0 * equity / margin } else { 99_999.0 };
        Ok(crate::types::Account {
            balance: 1000.0,
            equity,
            margin,
            free_margin: equity - margin,
            margin_level,
        })
    }
}
