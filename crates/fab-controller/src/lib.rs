//! fab-controller
//!
//! The Trade-Lifecycle Controller (spec §2 data flow, §5 concurrency, §9
//! redesign note): orchestrates the Strategy Engine, Portfolio Manager,
//! Sizing & Price Coordination, Execution Router, Reconciler, Rebalancer,
//! and Safety Plane on a periodic tick while maintaining the invariants in
//! spec §3 — exclusive position per symbol, two-sided opening,
//! persistence-before-tick-end, the monotone per-symbol lifecycle, capital
//! caps, and halt propagation.
//!
//! Per spec §9's explicit redesign flag, state is **per-symbol** rather
//! than a single global context: [`SymbolState`] is a tagged enum the
//! controller holds one of per tracked symbol, and `SymbolState::advance`
//! rejects any transition that would skip `Hedged` on the way out.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use fab_execution::{DualLegIntent, ExecutionError, ExecutionResult, ExecutionRouter, FailedLeg};
use fab_persistence::{PnlLedger, PositionStore};
use fab_portfolio::PortfolioManager;
use fab_rebalance::{detect_drift, execute_rebalance, plan_rebalance};
use fab_risk::{KillSwitch, MarginMonitor, MarginStatus};
use fab_schemas::{
    DecisionAction, Direction, FundingSnapshot, OrderRequest, OrderType, Position, Side, StrategyDecision,
    SymbolSpec, TimeInForce, VenueName,
};
use fab_sizing::{calculate_limit_prices_for_sides, calculate_quantity, get_coordinated_prices};
use fab_strategy::StrategyEngine;
use fab_venue::VenueAdapter;

/// `Live` places real orders; `Shadow` runs the full decision pipeline
/// (strategy, portfolio, sizing, risk gate) but substitutes a no-op
/// executor that never calls `place_order` — the mechanism behind the
/// `spot` CLI dry-run command (spec §6.4, SPEC_FULL §8.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TradeMode {
    Live,
    Shadow,
}

/// Per-symbol lifecycle state (spec §3 invariant 4, §9 redesign note):
/// `Idle -> Entering -> Hedged -> (Rebalancing -> Hedged)* -> Exiting ->
/// Idle`. `Entering -> Idle` is the one additional edge not named in the
/// happy-path cycle: a failed dual-leg open rolls back to `Idle` without
/// ever having reached `Hedged`.
#[derive(Clone, Debug, PartialEq)]
pub enum SymbolState {
    Idle,
    Entering,
    Hedged(Position),
    Rebalancing(Position),
    Exiting(Position),
}

impl SymbolState {
    fn tag(&self) -> &'static str {
        match self {
            SymbolState::Idle => "idle",
            SymbolState::Entering => "entering",
            SymbolState::Hedged(_) => "hedged",
            SymbolState::Rebalancing(_) => "rebalancing",
            SymbolState::Exiting(_) => "exiting",
        }
    }

    fn position(&self) -> Option<&Position> {
        match self {
            SymbolState::Hedged(p) | SymbolState::Rebalancing(p) | SymbolState::Exiting(p) => Some(p),
            SymbolState::Idle | SymbolState::Entering => None,
        }
    }
}

/// A transition the monotone lifecycle does not allow (spec §3 invariant
/// 4). This is a programming-error guard, not a runtime business
/// condition: every call site in this crate is expected to only ever
/// request legal transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal lifecycle transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

fn try_transition(from: &SymbolState, to: SymbolState) -> Result<SymbolState, IllegalTransition> {
    let legal = matches!(
        (from, &to),
        (SymbolState::Idle, SymbolState::Entering)
            | (SymbolState::Entering, SymbolState::Hedged(_))
            | (SymbolState::Entering, SymbolState::Idle)
            | (SymbolState::Hedged(_), SymbolState::Rebalancing(_))
            | (SymbolState::Rebalancing(_), SymbolState::Hedged(_))
            | (SymbolState::Hedged(_), SymbolState::Exiting(_))
            | (SymbolState::Exiting(_), SymbolState::Idle)
    );
    if legal {
        Ok(to)
    } else {
        Err(IllegalTransition { from: from.tag(), to: to.tag() })
    }
}

/// Static controller configuration mirroring spec §6.3's `risk`/`strategy`/
/// `execution` groups, flattened to what the tick loop actually consumes.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub order_notional: f64,
    pub max_spread_bps: f64,
    pub slippage_bps: f64,
    pub drift_threshold_bps: f64,
    pub stale_data_seconds: u64,
    pub time_in_force: TimeInForce,
}

/// What happened to one candidate during a tick — returned for logging and
/// for the `spot` CLI command's dry-run report (spec §6.4).
#[derive(Clone, Debug)]
pub enum TickEvent {
    Entered { symbol: String, quantity: f64 },
    EntrySkippedSpread { symbol: String, spread_bps: f64 },
    EntryFailed { symbol: String, leg: String },
    Exited { symbol: String },
    ExitFailed { symbol: String, leg: String },
    Rebalanced { symbol: String, drift_bps: f64 },
    RebalanceFailed { symbol: String, reason: String },
    HaltedEntry { symbol: String },
    ShadowWouldEnter { symbol: String, quantity: f64, primary_px: f64, hedge_px: f64 },
    ShadowWouldExit { symbol: String },
}

fn unix_epoch_s() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn unix_epoch_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Orchestrates the full funding-arb lifecycle across every tracked
/// symbol. Holds the per-symbol lifecycle map, the Strategy Engine, the
/// Portfolio Manager, the Kill Switch + Margin Monitor, and the durable
/// stores. Cooperative and single-threaded — the only parallelism is the
/// Execution Router's dual-leg dispatch, which is internal to
/// `fab-execution`.
pub struct Controller {
    mode: TradeMode,
    config: ControllerConfig,
    strategy: StrategyEngine,
    portfolio: PortfolioManager,
    kill_switch: KillSwitch,
    margin_monitor: MarginMonitor,
    position_store: PositionStore,
    pnl_ledger: PnlLedger,
    states: BTreeMap<String, SymbolState>,
}

impl Controller {
    /// Construct a controller, restoring any persisted open positions
    /// (spec §4.7: "on restart the map is restored verbatim") into both
    /// the lifecycle map and the Portfolio Manager's notional map (spec
    /// §6.2: "loaded and merged into the Portfolio Manager").
    pub fn new(
        mode: TradeMode,
        config: ControllerConfig,
        strategy: StrategyEngine,
        mut portfolio: PortfolioManager,
        kill_switch: KillSwitch,
        margin_monitor: MarginMonitor,
        position_store: PositionStore,
        pnl_ledger: PnlLedger,
    ) -> Self {
        let restored = position_store.load();
        let mut states = BTreeMap::new();
        for (symbol, position) in restored {
            // The persisted Position view (spec §3) does not carry
            // `size_usd` directly; notional is reconstructed from entry
            // price * filled quantity on the primary leg so the Portfolio
            // Manager's cap accounting survives a restart. Documented as a
            // restart-time approximation in DESIGN.md.
            let notional = (position.primary_entry_px * position.primary_filled_qty).abs();
            portfolio.register_position(&symbol, notional);
            states.insert(symbol, SymbolState::Hedged(position));
        }

        Self { mode, config, strategy, portfolio, kill_switch, margin_monitor, position_store, pnl_ledger, states }
    }

    pub fn is_tripped(&self) -> bool {
        self.kill_switch.is_tripped()
    }

    pub fn state_of(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    fn set_state(&mut self, symbol: &str, to: SymbolState) -> Result<(), IllegalTransition> {
        let from = self.states.entry(symbol.to_string()).or_insert(SymbolState::Idle).clone();
        let next = try_transition(&from, to)?;
        self.states.insert(symbol.to_string(), next);
        Ok(())
    }

    /// Flush the current open-position map to durable storage (spec §3
    /// invariant 3: persistence-before-tick-end).
    fn persist_positions(&self) {
        let positions: BTreeMap<String, Position> = self
            .states
            .iter()
            .filter_map(|(symbol, state)| state.position().map(|p| (symbol.clone(), p.clone())))
            .collect();
        self.position_store.save(&positions);
    }

    /// One controller tick (spec §2 data flow):
    /// `poll funding -> Strategy Engine -> Portfolio allocation -> Sizing/Price
    /// coordination -> Risk gate -> Execution Router -> Reconciler -> Persistence`,
    /// followed by a rebalance pass over every symbol currently `Hedged`.
    pub async fn tick(
        &mut self,
        primary: &dyn VenueAdapter,
        hedge: &dyn VenueAdapter,
        tracked_symbols: &[String],
        symbol_specs: &BTreeMap<String, SymbolSpec>,
    ) -> Vec<TickEvent> {
        let mut events = Vec::new();
        let now_ms = unix_epoch_ms();

        let mut enter_candidates = Vec::new();

        for symbol in tracked_symbols {
            // Each venue independently exposes the joined FundingSnapshot
            // (spec §3's FundingSnapshot already carries both rates); the
            // controller only needs to poll one side, so it always reads
            // the primary venue's view (documented in DESIGN.md).
            let snapshot: FundingSnapshot = match primary.next_funding(symbol).await {
                Ok(snap) => snap,
                Err(err) => {
                    tracing::warn!(symbol = %symbol, error = %err, "funding_poll_failed");
                    if err.is_transport() {
                        self.kill_switch.record_failure("funding poll transport error", now_ms);
                    }
                    continue;
                }
            };

            if snapshot.is_stale(now_ms, self.config.stale_data_seconds) {
                tracing::warn!(symbol = %symbol, "funding_snapshot_stale");
                continue;
            }

            let decision = match self.strategy.evaluate(&snapshot, self.config.order_notional) {
                Some(d) => d,
                None => continue,
            };

            match decision.action {
                DecisionAction::Exit => {
                    let event = self.handle_exit(primary, hedge, decision).await;
                    events.push(event);
                }
                DecisionAction::Enter => enter_candidates.push(decision),
            }
        }

        if !enter_candidates.is_empty() {
            events.extend(self.handle_entries(primary, hedge, &enter_candidates, symbol_specs, now_ms).await);
        }

        events.extend(self.run_rebalance_pass(primary, hedge, now_ms).await);

        self.persist_positions();
        events
    }

    async fn handle_entries(
        &mut self,
        primary: &dyn VenueAdapter,
        hedge: &dyn VenueAdapter,
        candidates: &[StrategyDecision],
        symbol_specs: &BTreeMap<String, SymbolSpec>,
        now_ms: i64,
    ) -> Vec<TickEvent> {
        let mut events = Vec::new();

        if self.kill_switch.is_tripped() || self.margin_monitor.any_critical() {
            for candidate in candidates {
                self.strategy.reset(&candidate.symbol);
                events.push(TickEvent::HaltedEntry { symbol: candidate.symbol.clone() });
            }
            return events;
        }

        let allocations = self.portfolio.allocate(candidates, self.config.order_notional);
        let allocated_symbols: std::collections::BTreeSet<&str> =
            allocations.iter().map(|a| a.symbol.as_str()).collect();
        for candidate in candidates {
            if !allocated_symbols.contains(candidate.symbol.as_str()) {
                // No capacity under the caps: roll back the engine's open
                // bookkeeping so the symbol can be re-evaluated next tick.
                self.strategy.reset(&candidate.symbol);
            }
        }

        for allocation in allocations {
            let candidate = candidates.iter().find(|c| c.symbol == allocation.symbol).expect("allocation symbol must originate from candidates");

            let spec = match symbol_specs.get(&allocation.symbol) {
                Some(spec) => spec,
                None => {
                    tracing::error!(symbol = %allocation.symbol, "missing_symbol_spec");
                    self.strategy.reset(&allocation.symbol);
                    continue;
                }
            };

            let coords = match get_coordinated_prices(&allocation.symbol, primary, hedge, self.config.max_spread_bps).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(symbol = %allocation.symbol, error = %err, "price_coordination_failed");
                    self.strategy.reset(&allocation.symbol);
                    continue;
                }
            };
            if !coords.acceptable {
                self.strategy.reset(&allocation.symbol);
                events.push(TickEvent::EntrySkippedSpread { symbol: allocation.symbol.clone(), spread_bps: coords.spread_bps });
                continue;
            }

            let quantity = match calculate_quantity(allocation.allocated_notional_usd, coords.primary_mid, spec) {
                Ok(q) if q > 0.0 => q,
                _ => {
                    self.strategy.reset(&allocation.symbol);
                    continue;
                }
            };

            let primary_side = candidate.direction.primary_side();
            let hedge_side = candidate.direction.hedge_side();
            let (primary_px, hedge_px) =
                calculate_limit_prices_for_sides(&coords, primary_side, hedge_side, self.config.slippage_bps);

            if self.mode == TradeMode::Shadow {
                events.push(TickEvent::ShadowWouldEnter {
                    symbol: allocation.symbol.clone(),
                    quantity,
                    primary_px,
                    hedge_px,
                });
                self.strategy.reset(&allocation.symbol);
                continue;
            }

            let ts = unix_epoch_s();
            let intent = DualLegIntent {
                primary: OrderRequest {
                    client_id: format!("primary:{}:{}", allocation.symbol, ts),
                    symbol: allocation.symbol.clone(),
                    side: primary_side,
                    size: quantity,
                    order_type: OrderType::Limit,
                    price: Some(primary_px),
                    reduce_only: false,
                    time_in_force: self.config.time_in_force,
                },
                hedge: OrderRequest {
                    client_id: format!("hedge:{}:{}", allocation.symbol, ts),
                    symbol: allocation.symbol.clone(),
                    side: hedge_side,
                    size: quantity,
                    order_type: OrderType::Limit,
                    price: Some(hedge_px),
                    reduce_only: false,
                    time_in_force: self.config.time_in_force,
                },
            };

            let router = ExecutionRouter::new(primary, hedge, true);
            match self.admit_open(&router, intent).await {
                Ok(result) => {
                    self.kill_switch.record_success();
                    let position = Position {
                        symbol: allocation.symbol.clone(),
                        direction: candidate.direction,
                        primary_filled_qty: result.primary.filled_size,
                        hedge_filled_qty: result.hedge.filled_size,
                        primary_entry_px: result.primary.average_fill_price.unwrap_or(primary_px),
                        hedge_entry_px: result.hedge.average_fill_price.unwrap_or(hedge_px),
                        is_balanced: result.is_balanced,
                    };
                    self.portfolio.register_position(&allocation.symbol, allocation.allocated_notional_usd);
                    if self.set_state(&allocation.symbol, SymbolState::Entering).is_ok() {
                        let _ = self.set_state(&allocation.symbol, SymbolState::Hedged(position));
                    }
                    events.push(TickEvent::Entered { symbol: allocation.symbol.clone(), quantity });
                }
                Err(err) => {
                    self.kill_switch.record_failure(&format!("entry failed: {err}"), now_ms);
                    self.strategy.reset(&allocation.symbol);
                    events.push(TickEvent::EntryFailed { symbol: allocation.symbol.clone(), leg: err.leg.to_string() });
                }
            }
        }

        events
    }

    /// Dispatch a dual-leg open and resolve the `ExecutionError{leg=parallel}`
    /// open question (spec §9): when the parallel dispatch raised but a
    /// sequential retry showed both legs filled, trust the Reconciler's
    /// verdict rather than the raised error — if the resulting fills are
    /// within tolerance, the position is treated as opened.
    async fn admit_open(
        &self,
        router: &ExecutionRouter<'_>,
        intent: DualLegIntent,
    ) -> Result<ExecutionResult, ExecutionError> {
        let primary_size = intent.primary.size;
        let hedge_size = intent.hedge.size;
        match router.execute(intent).await {
            Ok(result) => Ok(result),
            Err(err) if err.leg == FailedLeg::Parallel => {
                if let (Some(primary_partial), Some(hedge_partial)) = (&err.primary_partial, &err.hedge_partial) {
                    let reconciliation =
                        fab_execution::check_fills(primary_partial, hedge_partial, primary_size, hedge_size, 0.02);
                    if !reconciliation.needs_correction {
                        tracing::warn!("parallel_dispatch_error_overridden_by_reconciler_balance");
                        return Ok(ExecutionResult {
                            primary: primary_partial.clone(),
                            hedge: hedge_partial.clone(),
                            is_balanced: true,
                            imbalance: reconciliation.imbalance,
                        });
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_exit(
        &mut self,
        primary: &dyn VenueAdapter,
        hedge: &dyn VenueAdapter,
        decision: StrategyDecision,
    ) -> TickEvent {
        let symbol = decision.symbol.clone();
        let now_ms = unix_epoch_ms();

        let position = match self.states.get(&symbol) {
            Some(SymbolState::Hedged(p)) => p.clone(),
            _ => {
                tracing::warn!(symbol = %symbol, "exit_emitted_without_hedged_position");
                return TickEvent::ExitFailed { symbol, leg: "none".to_string() };
            }
        };

        if self.mode == TradeMode::Shadow {
            return TickEvent::ShadowWouldExit { symbol };
        }

        if self.set_state(&symbol, SymbolState::Exiting(position.clone())).is_err() {
            return TickEvent::ExitFailed { symbol, leg: "state".to_string() };
        }

        let closing_primary_side = position.direction.primary_side().opposite();
        let closing_hedge_side = position.direction.hedge_side().opposite();

        let coords = get_coordinated_prices(&symbol, primary, hedge, self.config.max_spread_bps).await.ok();
        let (primary_px, hedge_px) = coords
            .map(|c| calculate_limit_prices_for_sides(&c, closing_primary_side, closing_hedge_side, self.config.slippage_bps))
            .unwrap_or((position.primary_entry_px, position.hedge_entry_px));

        let ts = unix_epoch_s();
        let intent = DualLegIntent {
            primary: OrderRequest {
                client_id: format!("primary:{symbol}:{ts}-exit"),
                symbol: symbol.clone(),
                side: closing_primary_side,
                size: position.primary_filled_qty,
                order_type: OrderType::Limit,
                price: Some(primary_px),
                reduce_only: true,
                time_in_force: self.config.time_in_force,
            },
            hedge: OrderRequest {
                client_id: format!("hedge:{symbol}:{ts}-exit"),
                symbol: symbol.clone(),
                side: closing_hedge_side,
                size: position.hedge_filled_qty,
                order_type: OrderType::Limit,
                price: Some(hedge_px),
                reduce_only: true,
                time_in_force: self.config.time_in_force,
            },
        };

        let router = ExecutionRouter::new(primary, hedge, true);
        match router.execute(intent).await {
            Ok(_result) => {
                self.kill_switch.record_success();
                self.portfolio.close_position(&symbol);
                self.strategy.reset(&symbol);
                let _ = self.set_state(&symbol, SymbolState::Idle);
                TickEvent::Exited { symbol }
            }
            Err(err) => {
                self.kill_switch.record_failure(&format!("exit failed: {err}"), now_ms);
                // Revert the state bump so the exit is retried next tick
                // rather than leaving the symbol permanently `Exiting`.
                self.states.insert(symbol.clone(), SymbolState::Hedged(position));
                // `evaluate` already removed the symbol from the engine's
                // open map when it emitted this exit decision. Re-install it
                // so the next tick re-evaluates the symbol as open and
                // re-emits the exit instead of going silent.
                self.strategy.reopen(decision);
                TickEvent::ExitFailed { symbol, leg: err.leg.to_string() }
            }
        }
    }

    async fn run_rebalance_pass(
        &mut self,
        primary: &dyn VenueAdapter,
        hedge: &dyn VenueAdapter,
        now_ms: i64,
    ) -> Vec<TickEvent> {
        let mut events = Vec::new();

        if self.kill_switch.is_tripped() || self.mode == TradeMode::Shadow {
            return events;
        }

        let hedged_symbols: Vec<String> = self
            .states
            .iter()
            .filter_map(|(s, st)| matches!(st, SymbolState::Hedged(_)).then(|| s.clone()))
            .collect();

        if hedged_symbols.is_empty() {
            return events;
        }

        // Fetch both venues' live positions once per pass (spec §4.6: "the
        // controller fetches both venues' positions") rather than trusting
        // the controller's stored fill record, so drift from independent
        // venue fills or partial closes is visible.
        let primary_positions = match primary.get_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(error = %err, "rebalance_position_fetch_failed_primary");
                return events;
            }
        };
        let hedge_positions = match hedge.get_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(error = %err, "rebalance_position_fetch_failed_hedge");
                return events;
            }
        };

        for symbol in hedged_symbols {
            let position = match self.states.get(&symbol) {
                Some(SymbolState::Hedged(p)) => p.clone(),
                _ => continue,
            };

            let primary_vp = match primary_positions.iter().find(|p| p.symbol == symbol) {
                Some(p) => p,
                None => continue,
            };
            let hedge_vp = match hedge_positions.iter().find(|p| p.symbol == symbol) {
                Some(p) => p,
                None => continue,
            };

            let drift = match detect_drift(&symbol, primary_vp, hedge_vp, self.config.drift_threshold_bps) {
                Some(d) => d,
                None => continue,
            };

            if self.set_state(&symbol, SymbolState::Rebalancing(position.clone())).is_err() {
                continue;
            }

            let action = plan_rebalance(&drift);
            let limit_price = match get_coordinated_prices(&symbol, primary, hedge, self.config.max_spread_bps).await {
                Ok(c) => {
                    let factor = 1.0 + self.config.slippage_bps / 10_000.0;
                    if action.side == Side::Buy { c.hedge_mid * factor } else { c.hedge_mid / factor }
                }
                Err(_) => position.hedge_entry_px,
            };

            match execute_rebalance(&action, hedge, limit_price).await {
                Ok(result) => {
                    self.kill_switch.record_success();
                    let signed_delta = result.filled_size * action.side.sign();
                    let mut updated = position.clone();
                    let current_hedge_side_sign = position.direction.hedge_side().sign();
                    updated.hedge_filled_qty = (updated.hedge_filled_qty * current_hedge_side_sign + signed_delta).abs();
                    updated.is_balanced = true;
                    let _ = self.set_state(&symbol, SymbolState::Hedged(updated));
                    events.push(TickEvent::Rebalanced { symbol, drift_bps: drift.drift_bps });
                }
                Err(err) => {
                    self.kill_switch.record_failure(&format!("rebalance failed: {err}"), now_ms);
                    // Stay logically `Hedged` for the next tick's retry
                    // (spec §7: "correction failures are logged and retried
                    // next tick") — revert the `Rebalancing` bump.
                    let _ = self.set_state(&symbol, SymbolState::Hedged(position));
                    events.push(TickEvent::RebalanceFailed { symbol, reason: err.to_string() });
                }
            }
        }

        events
    }

    pub fn total_pnl(&self) -> fab_persistence::TotalPnl {
        self.pnl_ledger.total_pnl()
    }

    pub fn margin_status(&mut self, venue: VenueName, utilization: f64) -> MarginStatus {
        self.margin_monitor.update_margin_usage(venue, utilization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_portfolio::PortfolioLimits;
    use fab_risk::KillSwitchConfig;
    use fab_schemas::Ticker;
    use fab_strategy::StrategyConfig;
    use fab_venue::PaperVenue;

    fn spec(lot: f64) -> SymbolSpec {
        SymbolSpec { symbol: "ETH".into(), base_asset: "ETH".into(), quote_asset: "USD".into(), tick_size: 0.1, lot_size: lot, max_leverage: 10.0 }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            order_notional: 1_000.0,
            max_spread_bps: 100.0,
            slippage_bps: 5.0,
            drift_threshold_bps: 50.0,
            stale_data_seconds: 30,
            time_in_force: TimeInForce::Ioc,
        }
    }

    fn controller(mode: TradeMode, dir: &tempfile::TempDir) -> Controller {
        Controller::new(
            mode,
            config(),
            StrategyEngine::new(StrategyConfig::new(20.0, 5.0).unwrap()),
            PortfolioManager::new(PortfolioLimits { max_total_notional: 100_000.0, max_symbol_notional: 10_000.0, max_positions: 10 }),
            KillSwitch::new(KillSwitchConfig { max_consecutive_failures: 3, max_failures_per_hour: 10 }),
            MarginMonitor::new(0.2),
            PositionStore::new(dir.path().join("positions.json")),
            PnlLedger::new(dir.path().join("pnl.json")),
        )
    }

    fn seed_venues(primary: &PaperVenue, hedge: &PaperVenue, now_ms: i64) {
        primary.set_funding(FundingSnapshot { symbol: "ETH".into(), primary_rate_bps: 50.0, hedge_rate_bps: 10.0, timestamp_ms: now_ms });
        primary.set_ticker(Ticker { symbol: "ETH".into(), bid: 2_499.0, ask: 2_501.0, timestamp_ms: now_ms });
        hedge.set_ticker(Ticker { symbol: "ETH".into(), bid: 2_498.0, ask: 2_502.0, timestamp_ms: now_ms });
    }

    #[tokio::test]
    async fn live_tick_opens_a_hedged_position_on_entry_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(TradeMode::Live, &dir);

        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let now_ms = unix_epoch_ms();
        seed_venues(&primary, &hedge, now_ms);

        let mut specs = BTreeMap::new();
        specs.insert("ETH".to_string(), spec(0.001));
        let symbols = vec!["ETH".to_string()];

        let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
        assert!(events.iter().any(|e| matches!(e, TickEvent::Entered { .. })));
        assert!(matches!(ctrl.state_of("ETH"), Some(SymbolState::Hedged(_))));
    }

    #[tokio::test]
    async fn shadow_mode_never_calls_place_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(TradeMode::Shadow, &dir);

        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let now_ms = unix_epoch_ms();
        seed_venues(&primary, &hedge, now_ms);

        let mut specs = BTreeMap::new();
        specs.insert("ETH".to_string(), spec(0.001));
        let symbols = vec!["ETH".to_string()];

        let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
        assert!(events.iter().any(|e| matches!(e, TickEvent::ShadowWouldEnter { .. })));
        assert!(matches!(ctrl.state_of("ETH"), None | Some(SymbolState::Idle)));
    }

    #[tokio::test]
    async fn stale_snapshot_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(TradeMode::Live, &dir);

        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let now_ms = unix_epoch_ms();
        primary.set_funding(FundingSnapshot { symbol: "ETH".into(), primary_rate_bps: 50.0, hedge_rate_bps: 10.0, timestamp_ms: now_ms - 120_000 });

        let mut specs = BTreeMap::new();
        specs.insert("ETH".to_string(), spec(0.001));
        let symbols = vec!["ETH".to_string()];

        let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn rebalance_pass_uses_live_venue_positions_not_stored_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(TradeMode::Live, &dir);

        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let now_ms = unix_epoch_ms();
        seed_venues(&primary, &hedge, now_ms);

        let mut specs = BTreeMap::new();
        specs.insert("ETH".to_string(), spec(0.001));
        let symbols = vec!["ETH".to_string()];

        // First tick opens the hedged position. Neither venue has a seeded
        // live position yet, so the rebalance pass inside this same tick
        // finds nothing to measure and leaves the position untouched.
        let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
        assert!(events.iter().any(|e| matches!(e, TickEvent::Entered { .. })));
        assert!(!events.iter().any(|e| matches!(e, TickEvent::Rebalanced { .. })));

        // Independently drift the two venues' live positions — this is
        // exactly the "asymmetric/independent venue fill" scenario the
        // stored `Position` fill record can never see on its own.
        primary.set_position(fab_schemas::VenuePosition {
            symbol: "ETH".into(),
            side: Side::Sell,
            size: 1.0,
            entry_price: 2_500.0,
            leverage: 5.0,
        });
        hedge.set_position(fab_schemas::VenuePosition {
            symbol: "ETH".into(),
            side: Side::Buy,
            size: 0.5,
            entry_price: 2_498.0,
            leverage: 5.0,
        });

        let events = ctrl.tick(&primary, &hedge, &symbols, &specs).await;
        assert!(events.iter().any(|e| matches!(e, TickEvent::Rebalanced { .. })));
        assert!(matches!(ctrl.state_of("ETH"), Some(SymbolState::Hedged(p)) if p.is_balanced));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let err = try_transition(&SymbolState::Idle, SymbolState::Hedged(Position {
            symbol: "ETH".into(),
            direction: Direction::LongPrimaryShortHedge,
            primary_filled_qty: 1.0,
            hedge_filled_qty: 1.0,
            primary_entry_px: 2_500.0,
            hedge_entry_px: 2_498.0,
            is_balanced: true,
        })).unwrap_err();
        assert_eq!(err.from, "idle");
        assert_eq!(err.to, "hedged");
    }

    #[test]
    fn legal_transitions_are_accepted() {
        assert!(try_transition(&SymbolState::Idle, SymbolState::Entering).is_ok());
        assert!(try_transition(&SymbolState::Entering, SymbolState::Idle).is_ok());
    }
}
