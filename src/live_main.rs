/// live_main.rs — Closure Daemon Entry Point
///
/// Runs the orchestrator continuously against a `PaperBroker`, polling
/// at a fixed cadence. A real MT5 bridge is out of scope (spec §6); this
/// binary demonstrates the tick loop, throttles, and logging the way a
/// production daemon built around this engine would wire them.
///
/// FLOW:
///   1. Load config from .env
///   2. Seed a demo portfolio (stands in for an initial broker fetch)
///   3. Tick on a fixed interval until Ctrl-C
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hedge_engine::broker::{LoggingObserver, NeutralMarketAnalyzer, PaperBroker};
use hedge_engine::config::EngineConfig;
use hedge_engine::orchestrator::{Orchestrator, TickOutcome};
use hedge_engine::Side;

/// Poll cadence. A real deployment would tick once per incoming price
/// update rather than a fixed wall-clock interval; polling is used here
/// for simplicity.
const POLL_INTERVAL_SECONDS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║     HEDGE ENGINE  —  CLOSURE DAEMON MODE    ║");
    info!("║     paper broker — no live MT5 connection   ║");
    info!("╚══════════════════════════════════════════════╝");

    let cfg = EngineConfig::from_env().unwrap_or_default();
    info!(symbol = %cfg.symbol, zone_width = cfg.zone_width, tick_budget_ms = cfg.tick_budget_ms, "config loaded");

    let broker = Arc::new(PaperBroker::new(cfg.default_spread_points));
    broker.seed(Side::Buy, 0.01, 1900.0, 1900.8, 0);
    broker.seed(Side::Sell, 0.01, 1905.0, 1904.7, 0);
    broker.seed(Side::Buy, 0.02, 1895.0, 1882.0, -7200);

    let orchestrator = Orchestrator::new(
        broker.clone(),
        Arc::new(NeutralMarketAnalyzer),
        Arc::new(LoggingObserver),
        cfg,
    );

    let mut now = 1_700_000_000i64;
    loop {
        match orchestrator.tick(now).await {
            Ok(TickOutcome::NoAction { reason }) => {
                info!(reason, "tick complete, no action");
            }
            Ok(TickOutcome::Closed(result)) => {
                info!(
                    members = ?result.members,
                    realized = result.realized_pnl,
                    fully_succeeded = result.fully_succeeded,
                    "closure executed"
                );
            }
            Err(err) => {
                warn!(error = %err, "tick failed");
            }
        }

        if orchestrator.state().live_positions.is_empty() {
            info!("no open positions remain, daemon exiting");
            break;
        }

        sleep(Duration::from_secs(POLL_INTERVAL_SECONDS)).await;
        now += POLL_INTERVAL_SECONDS as i64;
    }

    Ok(())
}
