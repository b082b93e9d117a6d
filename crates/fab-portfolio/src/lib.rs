//! fab-portfolio
//!
//! Portfolio Manager (spec §4.2): allocates capital across multiple
//! concurrent funding-arb opportunities under a total-notional cap, a
//! per-symbol notional cap, and a maximum open-position count. Owns the
//! `open_positions -> notional` map; `register_position` and
//! `close_position` are its only mutators (spec §4.2, §9 design note).

use std::collections::BTreeMap;

use fab_schemas::{DecisionAction, PortfolioAllocation, StrategyDecision};

/// Baseline edge (bps) at which the notional scaling multiplier is exactly
/// 1.0 (spec §4.2 step 3).
const BASELINE_EDGE_BPS: f64 = 20.0;
/// Upper bound of the edge-based scaling multiplier.
const MAX_EDGE_MULTIPLIER: f64 = 2.0;
/// A capped remainder is only accepted if it is at least half of
/// `base_notional`; otherwise the allocator stops (spec §4.2 step 4).
const MIN_ACCEPTABLE_REMAINDER_FRACTION: f64 = 0.5;

#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioLimits {
    pub max_total_notional: f64,
    pub max_symbol_notional: f64,
    pub max_positions: usize,
}

/// Allocates capital across a multi-symbol portfolio of open and candidate
/// funding-arb positions.
#[derive(Clone, Debug)]
pub struct PortfolioManager {
    limits: PortfolioLimits,
    open_positions: BTreeMap<String, f64>,
}

impl PortfolioManager {
    pub fn new(limits: PortfolioLimits) -> Self {
        Self {
            limits,
            open_positions: BTreeMap::new(),
        }
    }

    pub fn open_symbols(&self) -> impl Iterator<Item = &str> {
        self.open_positions.keys().map(String::as_str)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    /// Notional currently committed across all open positions.
    pub fn total_allocated_notional(&self) -> f64 {
        self.open_positions.values().sum()
    }

    /// Remaining capacity under `max_total_notional`, never negative.
    pub fn available_capacity(&self) -> f64 {
        (self.limits.max_total_notional - self.total_allocated_notional()).max(0.0)
    }

    /// Register a newly opened position. Idempotent: re-registering a
    /// symbol overwrites its notional rather than double-counting it.
    pub fn register_position(&mut self, symbol: &str, notional_usd: f64) {
        self.open_positions.insert(symbol.to_string(), notional_usd);
    }

    /// Remove a closed position. No-op if the symbol was not open.
    pub fn close_position(&mut self, symbol: &str) {
        self.open_positions.remove(symbol);
    }

    /// Allocate capital across `candidates` (only `enter` decisions are
    /// meaningful here; `exit` decisions are ignored since they carry no
    /// allocation request).
    ///
    /// Algorithm (spec §4.2):
    /// 1. Sort by descending `|edge_bps|`, tie-break symbol lexicographic.
    /// 2. Skip symbols already open; stop once `open_count + allocated_so_far
    ///    >= max_positions`.
    /// 3. Scale: `min(base_notional * clamp(edge_bps/20, 0, 2.0),
    ///    max_symbol_notional)`.
    /// 4. Cap against the remaining total-notional budget: truncate to the
    ///    remainder only if the remainder is `>= 0.5 * base_notional`,
    ///    otherwise stop allocating entirely (later candidates have weaker
    ///    edges and are no more likely to clear the minimum).
    pub fn allocate(
        &self,
        candidates: &[StrategyDecision],
        base_notional: f64,
    ) -> Vec<PortfolioAllocation> {
        let mut sorted: Vec<&StrategyDecision> = candidates
            .iter()
            .filter(|d| d.action == DecisionAction::Enter)
            .collect();
        sorted.sort_by(|a, b| {
            b.edge_bps
                .abs()
                .partial_cmp(&a.edge_bps.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let mut allocations = Vec::new();
        let mut total_allocated = self.total_allocated_notional();

        for candidate in sorted {
            if self.open_positions.contains_key(&candidate.symbol) {
                continue;
            }

            if self.open_positions.len() + allocations.len() >= self.limits.max_positions {
                break;
            }

            let multiplier = (candidate.edge_bps.abs() / BASELINE_EDGE_BPS).clamp(0.0, MAX_EDGE_MULTIPLIER);
            let mut allocated = (base_notional * multiplier).min(self.limits.max_symbol_notional);

            if total_allocated + allocated > self.limits.max_total_notional {
                let remaining = self.limits.max_total_notional - total_allocated;
                if remaining >= MIN_ACCEPTABLE_REMAINDER_FRACTION * base_notional {
                    allocated = remaining;
                } else {
                    break;
                }
            }

            allocations.push(PortfolioAllocation {
                symbol: candidate.symbol.clone(),
                allocated_notional_usd: allocated,
                priority: allocations.len(),
            });
            total_allocated += allocated;
        }

        allocations
    }
}
