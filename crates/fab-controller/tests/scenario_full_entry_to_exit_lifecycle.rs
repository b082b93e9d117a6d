//! Validates: a full tick-by-tick trade lifecycle through the public
//! `Controller` API — `Idle -> Entering -> Hedged -> Exiting -> Idle` —
//! driven purely by the funding edge crossing the entry then exit
//! thresholds, with no direct access to internal state.
//!
//! GREEN when: tick 1 opens a hedged position, tick 2 (edge still wide)
//! emits nothing new, tick 3 (edge collapsed below `exit_edge_bps`) closes
//! it back to idle, and the position store ends the scenario empty.

use std::collections::BTreeMap;

use fab_controller::{Controller, ControllerConfig, TradeMode};
use fab_persistence::{PnlLedger, PositionStore};
use fab_portfolio::{PortfolioLimits, PortfolioManager};
use fab_risk::{KillSwitch, KillSwitchConfig, MarginMonitor};
use fab_schemas::{FundingSnapshot, SymbolSpec, Ticker, TimeInForce};
use fab_strategy::{StrategyConfig, StrategyEngine};
use fab_venue::PaperVenue;

fn build_controller(dir: &std::path::Path) -> Controller {
    Controller::new(
        TradeMode::Live,
        ControllerConfig {
            order_notional: 1_000.0,
            max_spread_bps: 100.0,
            slippage_bps: 5.0,
            drift_threshold_bps: 50.0,
            stale_data_seconds: 30,
            time_in_force: TimeInForce::Ioc,
        },
        StrategyEngine::new(StrategyConfig::new(20.0, 5.0).unwrap()),
        PortfolioManager::new(PortfolioLimits { max_total_notional: 100_000.0, max_symbol_notional: 10_000.0, max_positions: 10 }),
        KillSwitch::new(KillSwitchConfig { max_consecutive_failures: 3, max_failures_per_hour: 10 }),
        MarginMonitor::new(0.2),
        PositionStore::new(dir.join("positions.json")),
        PnlLedger::new(dir.join("pnl.json")),
    )
}

#[tokio::test]
async fn enters_holds_then_exits_as_the_edge_collapses() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctrl = build_controller(dir.path());

    let primary = PaperVenue::new("primary");
    let hedge = PaperVenue::new("hedge");
    let mut specs = BTreeMap::new();
    specs.insert(
        "ETH".to_string(),
        SymbolSpec { symbol: "ETH".into(), base_asset: "ETH".into(), quote_asset: "USD".into(), tick_size: 0.1, lot_size: 0.001, max_leverage: 10.0 },
    );
    let symbols = vec!["ETH".to_string()];

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    primary.set_ticker(Ticker { symbol: "ETH".into(), bid: 2_499.0, ask: 2_501.0, timestamp_ms: now_ms });
    hedge.set_ticker(Ticker { symbol: "ETH".into(), bid: 2_498.0, ask: 2_502.0, timestamp_ms: now_ms });

    // Tick 1: wide edge (40bps) opens a hedged position.
    primary.set_funding(FundingSnapshot { symbol: "ETH".into(), primary_rate_bps: 50.0, hedge_rate_bps: 10.0, timestamp_ms: now_ms });
    let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
    assert!(events.iter().any(|e| matches!(e, fab_controller::TickEvent::Entered { .. })));
    assert!(matches!(ctrl.state_of("ETH"), Some(fab_controller::SymbolState::Hedged(_))));

    // Tick 2: edge stays wide — strategy engine emits no new decision.
    let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
    assert!(!events.iter().any(|e| matches!(e, fab_controller::TickEvent::Exited { .. })));
    assert!(matches!(ctrl.state_of("ETH"), Some(fab_controller::SymbolState::Hedged(_))));

    // Tick 3: edge collapses under exit_edge_bps (5) — position closes.
    primary.set_funding(FundingSnapshot { symbol: "ETH".into(), primary_rate_bps: 6.0, hedge_rate_bps: 5.0, timestamp_ms: now_ms });
    let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
    assert!(events.iter().any(|e| matches!(e, fab_controller::TickEvent::Exited { .. })));
    assert!(matches!(ctrl.state_of("ETH"), Some(fab_controller::SymbolState::Idle) | None));

    // The position store reflects the fully-closed state: nothing to
    // restore on a fresh restart.
    let restored = PositionStore::new(dir.path().join("positions.json")).load();
    assert!(restored.is_empty());

    Ok(())
}
