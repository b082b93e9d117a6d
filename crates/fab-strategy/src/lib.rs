//! fab-strategy
//!
//! Strategy Engine (spec §4.1): pure, synchronous, per-symbol enter/exit
//! decisioning with mandatory hysteresis. No IO, no time, no venue calls —
//! the controller is responsible for staleness filtering before a snapshot
//! ever reaches `evaluate`.

use std::collections::BTreeMap;

use fab_schemas::{DecisionAction, Direction, FundingSnapshot, StrategyDecision};

/// `exit_edge_bps` must be strictly less than `min_edge_bps`, or the engine
/// could oscillate between enter and exit on the same edge value.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyConfig {
    pub min_edge_bps: f64,
    pub exit_edge_bps: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidStrategyConfig;

impl std::fmt::Display for InvalidStrategyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit_edge_bps must be < min_edge_bps (hysteresis required)")
    }
}

impl std::error::Error for InvalidStrategyConfig {}

impl StrategyConfig {
    pub fn new(min_edge_bps: f64, exit_edge_bps: f64) -> Result<Self, InvalidStrategyConfig> {
        if !(exit_edge_bps < min_edge_bps) {
            return Err(InvalidStrategyConfig);
        }
        Ok(Self {
            min_edge_bps,
            exit_edge_bps,
        })
    }
}

/// Per-symbol enter/exit decisioning. Holds the map of currently-open
/// decisions, keyed by symbol — this is the only mutable state in the
/// engine.
#[derive(Clone, Debug, Default)]
pub struct StrategyEngine {
    cfg_min_edge_bps: f64,
    cfg_exit_edge_bps: f64,
    open: BTreeMap<String, StrategyDecision>,
}

impl StrategyEngine {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self {
            cfg_min_edge_bps: cfg.min_edge_bps,
            cfg_exit_edge_bps: cfg.exit_edge_bps,
            open: BTreeMap::new(),
        }
    }

    /// Symbols the engine currently considers open (an `enter` was emitted
    /// and no matching `exit` has been emitted since).
    pub fn open_symbols(&self) -> impl Iterator<Item = &str> {
        self.open.keys().map(String::as_str)
    }

    /// Evaluate one fresh, already-validated `FundingSnapshot`.
    ///
    /// - If the symbol has an open decision: emits `exit` once
    ///   `|edge| <= exit_edge_bps`, otherwise emits nothing.
    /// - If the symbol has no open decision: emits `enter` once
    ///   `|edge| >= min_edge_bps`, otherwise emits nothing.
    ///
    /// Tie-break: `|edge| == min_edge_bps` is an entry; `|edge| ==
    /// exit_edge_bps` is an exit.
    pub fn evaluate(&mut self, snapshot: &FundingSnapshot, notional_usd: f64) -> Option<StrategyDecision> {
        let edge = snapshot.edge_bps();

        if self.open.contains_key(&snapshot.symbol) {
            if edge.abs() <= self.cfg_exit_edge_bps {
                let mut decision = self.open.remove(&snapshot.symbol)?;
                decision.action = DecisionAction::Exit;
                return Some(decision);
            }
            return None;
        }

        if edge.abs() < self.cfg_min_edge_bps {
            return None;
        }

        let decision = StrategyDecision {
            symbol: snapshot.symbol.clone(),
            edge_bps: edge,
            direction: Direction::from_edge(edge),
            size_usd: notional_usd,
            action: DecisionAction::Enter,
        };
        self.open.insert(snapshot.symbol.clone(), decision.clone());
        Some(decision)
    }

    /// Force-clear a symbol's open-decision bookkeeping without emitting an
    /// exit decision. Used only when the controller has already decided a
    /// position is closed through some path other than a clean exit (e.g. a
    /// failed-open rollback) and must resynchronize the engine's view.
    pub fn reset(&mut self, symbol: &str) {
        self.open.remove(symbol);
    }

    /// Re-install a decision into the open-position bookkeeping. Used when
    /// the controller fails to execute a decision `evaluate` already
    /// produced (e.g. an exit order that didn't fill) and needs the engine
    /// to keep treating the symbol as open so the next tick re-evaluates
    /// and re-emits it, instead of going silent because the symbol was
    /// already removed from `open` when the decision was first returned.
    pub fn reopen(&mut self, decision: StrategyDecision) {
        self.open.insert(decision.symbol.clone(), decision);
    }
}
