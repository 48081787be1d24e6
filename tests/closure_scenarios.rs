// tests/closure_scenarios.rs
//
// End-to-end scenarios against the orchestrator with a PaperBroker,
// covering the balance guard, cooldown throttle, and emergency-mode
// relaxation paths that the per-module unit tests don't exercise
// end-to-end.

use std::sync::Arc;

use hedge_engine::broker::{LoggingObserver, NeutralMarketAnalyzer, PaperBroker};
use hedge_engine::config::EngineConfig;
use hedge_engine::orchestrator::{Orchestrator, TickOutcome};
use hedge_engine::Side;

fn orchestrator_with(broker: Arc<PaperBroker>, cfg: EngineConfig) -> Orchestrator {
    Orchestrator::new(broker, Arc::new(NeutralMarketAnalyzer), Arc::new(LoggingObserver), cfg)
}

#[tokio::test]
async fn s4_balance_guard_blocks_collapsing_closure() {
    // 10 small buy winners, 1 big sell winner: closing everything would
    // collapse the buy/sell balance even though it is all profitable.
    let broker = Arc::new(PaperBroker::new(1.5));
    for i in 0..10 {
        broker.seed(Side::Buy, 0.01, 1900.0 + i as f64, 1900.1 + i as f64, 0);
    }
    broker.seed(Side::Sell, 0.01, 1950.0, 1945.0, 0);

    let orchestrator = orchestrator_with(broker.clone(), EngineConfig::default());
    let outcome = orchestrator.tick(1000).await.unwrap();

    // Whatever the finder proposes, either nothing is admissible or the
    // admitted group leaves the portfolio non-collapsed — it must never
    // close all 11 positions in one shot.
    if let TickOutcome::Closed(result) = outcome {
        assert!(result.members.len() < 11, "balance guard should reject closing the entire skewed book at once");
    }
}

#[tokio::test]
async fn s5_cooldown_prevents_back_to_back_closures() {
    let broker = Arc::new(PaperBroker::new(1.5));
    broker.seed(Side::Buy, 0.01, 1900.0, 1900.8, 0);
    broker.seed(Side::Sell, 0.01, 1905.0, 1904.7, 0);

    let cfg = EngineConfig::default();
    let orchestrator = orchestrator_with(broker.clone(), cfg.clone());

    let first = orchestrator.tick(1000).await.unwrap();
    assert!(matches!(first, TickOutcome::Closed(_)));

    broker.seed(Side::Buy, 0.01, 1900.0, 1900.8, 0);
    broker.seed(Side::Sell, 0.01, 1905.0, 1904.7, 0);

    let second = orchestrator.tick(1005).await.unwrap();
    assert!(matches!(second, TickOutcome::NoAction { reason: "cooldown active" }));

    let third = orchestrator.tick(1000 + cfg.closing_cooldown_seconds + 1).await.unwrap();
    assert!(matches!(third, TickOutcome::Closed(_)));
}

#[tokio::test]
async fn s6_emergency_mode_accepts_thin_margin_closure() {
    // Heavy margin usage (large volume relative to equity) pushes the
    // account into the Critical regime, which relaxes the net-profit floor.
    let broker = Arc::new(PaperBroker::new(1.5));
    broker.seed(Side::Buy, 1.0, 1900.0, 1900.15, 0);
    broker.seed(Side::Sell, 1.0, 1900.3, 1900.2, 0);

    let cfg = EngineConfig::default();
    let orchestrator = orchestrator_with(broker, cfg);
    let outcome = orchestrator.tick(1000).await.unwrap();

    match outcome {
        TickOutcome::Closed(result) => {
            assert!(result.predicted_net_pnl >= 0.0 || result.fully_succeeded);
        }
        TickOutcome::NoAction { .. } => {
            // Acceptable: the tiny book may simply have no admissible
            // candidate above even the emergency floor.
        }
    }
}

#[tokio::test]
async fn no_positions_yields_noop_without_touching_broker_close() {
    let broker = Arc::new(PaperBroker::new(1.5));
    let orchestrator = orchestrator_with(broker, EngineConfig::default());
    let outcome = orchestrator.tick(1000).await.unwrap();
    assert!(matches!(outcome, TickOutcome::NoAction { reason: "no open positions" }));
}

#[tokio::test]
async fn repeated_ticks_after_full_closure_stay_idle() {
    let broker = Arc::new(PaperBroker::new(1.5));
    broker.seed(Side::Buy, 0.01, 1900.0, 1900.8, 0);
    broker.seed(Side::Sell, 0.01, 1905.0, 1904.7, 0);

    let cfg = EngineConfig::default();
    let cooldown = cfg.closing_cooldown_seconds;
    let orchestrator = orchestrator_with(broker, cfg);

    orchestrator.tick(1000).await.unwrap();
    let outcome = orchestrator.tick(1000 + cooldown + 5).await.unwrap();
    assert!(matches!(outcome, TickOutcome::NoAction { reason: "no open positions" }));
}
