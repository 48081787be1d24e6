/// main.rs — Closure Report Entry Point
///
/// Runs a single orchestrator tick against a seeded `PaperBroker` and
/// prints the resulting decision. Useful for smoke-testing a
/// configuration change or demonstrating the engine's scoring/purpose/
/// hedge-finding output without standing up a live connection.
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hedge_engine::broker::{LoggingObserver, NeutralMarketAnalyzer, PaperBroker};
use hedge_engine::config::EngineConfig;
use hedge_engine::orchestrator::{Orchestrator, TickOutcome};
use hedge_engine::Side;

/// Print a single closure decision for a synthetic seeded portfolio.
#[derive(Parser, Debug)]
#[command(name = "closure_report", about = "Run one closure-engine tick against a seeded demo portfolio")]
struct Args {
    /// Number of synthetic buy/sell pairs to seed (spread symmetrically around 1900).
    #[arg(long, default_value_t = 3)]
    pairs: u32,

    /// Unix timestamp to run the tick at.
    #[arg(long, default_value_t = 1_700_000_000)]
    now: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = EngineConfig::from_env().unwrap_or_default();

    info!("╔══════════════════════════════════════════════╗");
    info!("║     HEDGE ENGINE  —  CLOSURE REPORT MODE    ║");
    info!("╚══════════════════════════════════════════════╝");
    info!(symbol = %cfg.symbol, zone_width = cfg.zone_width, "config loaded");

    let broker = Arc::new(PaperBroker::new(cfg.default_spread_points));
    for i in 0..args.pairs {
        let drift = i as f64 * cfg.zone_width;
        broker.seed(Side::Buy, 0.01, 1900.0 + drift, 1900.0 + drift, args.now - 3600);
        broker.seed(
            Side::Sell,
            0.01,
            1900.0 + drift + 5.0,
            1900.0 + drift + 4.5,
            args.now - 1800,
        );
    }

    let orchestrator = Orchestrator::new(
        broker,
        Arc::new(NeutralMarketAnalyzer),
        Arc::new(LoggingObserver),
        cfg,
    );

    match orchestrator.tick(args.now).await? {
        TickOutcome::NoAction { reason } => {
            info!(reason, "tick produced no action");
        }
        TickOutcome::Closed(result) => {
            info!(
                members = ?result.members,
                predicted = result.predicted_net_pnl,
                realized = result.realized_pnl,
                fully_succeeded = result.fully_succeeded,
                "tick closed a group"
            );
        }
    }

    Ok(())
}
