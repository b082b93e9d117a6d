//! fab-schemas
//!
//! Shared wire/domain types for the funding-rate arbitrage engine. Every
//! other crate in the workspace depends on this one and nothing else
//! upstream — it carries no logic, only data and the small enums that
//! disambiguate it.

use serde::{Deserialize, Serialize};

/// Which of the two venues a value refers to. The controller always holds
/// exactly two adapters, named relative to each other rather than by
/// concrete exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueName {
    Primary,
    Hedge,
}

impl std::fmt::Display for VenueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueName::Primary => write!(f, "primary"),
            VenueName::Hedge => write!(f, "hedge"),
        }
    }
}

/// Static per-venue attributes of a tradable symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub max_leverage: f64,
}

/// Order side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that would close a position opened with `self`.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell — used to convert a venue's `(side, size)`
    /// pair into a signed exposure quantity.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported order types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

/// Time-in-force policies (§6.1 / GLOSSARY).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Ioc,
    Gtt,
    PostOnly,
}

/// Order intent envelope submitted to a venue adapter (§6.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    /// Base-asset units, always positive.
    pub size: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
}

/// Result of an order submission (§6.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub client_id: String,
    pub exchange_order_id: String,
    pub status: String,
    pub filled_size: f64,
    pub average_fill_price: Option<f64>,
}

/// The venue's own view of an open position (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
}

/// Bid/ask mid snapshot used by §4.3 price coordination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: i64,
}

impl Ticker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Per-symbol funding rates sampled from both venues at (approximately) the
/// same instant (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub symbol: String,
    pub primary_rate_bps: f64,
    pub hedge_rate_bps: f64,
    pub timestamp_ms: i64,
}

impl FundingSnapshot {
    /// `primary_rate_bps - hedge_rate_bps` (§3).
    pub fn edge_bps(&self) -> f64 {
        self.primary_rate_bps - self.hedge_rate_bps
    }

    /// True when `now_ms - timestamp_ms` exceeds the configured staleness
    /// bound. The Strategy Engine itself does not inspect timestamps (§4.1);
    /// this is the check the controller runs before handing a snapshot to
    /// the engine.
    pub fn is_stale(&self, now_ms: i64, stale_after_seconds: u64) -> bool {
        let age_ms = now_ms.saturating_sub(self.timestamp_ms);
        age_ms > (stale_after_seconds as i64).saturating_mul(1_000)
    }
}

/// Which venue is long and which is short for a positive or negative edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LongPrimaryShortHedge,
    LongHedgeShortPrimary,
}

impl Direction {
    /// Sign of `edge_bps` determines direction: a positive edge means the
    /// primary venue's funding rate is higher, so the entering position
    /// shorts primary (collects funding) and longs hedge.
    pub fn from_edge(edge_bps: f64) -> Direction {
        if edge_bps > 0.0 {
            Direction::LongHedgeShortPrimary
        } else {
            Direction::LongPrimaryShortHedge
        }
    }

    pub fn primary_side(self) -> Side {
        match self {
            Direction::LongPrimaryShortHedge => Side::Buy,
            Direction::LongHedgeShortPrimary => Side::Sell,
        }
    }

    pub fn hedge_side(self) -> Side {
        self.primary_side().opposite()
    }
}

/// Enter or exit an opportunity (§3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Enter,
    Exit,
}

/// Output of the Strategy Engine (§4.1), consumed by the Portfolio Manager
/// and the Execution Router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub symbol: String,
    pub edge_bps: f64,
    pub direction: Direction,
    pub size_usd: f64,
    pub action: DecisionAction,
}

/// Controller-owned view of an open delta-neutral position (§3). Created on
/// successful dual-leg fill; mutated only by the Rebalancer or exit;
/// destroyed on confirmed exit fill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub primary_filled_qty: f64,
    pub hedge_filled_qty: f64,
    pub primary_entry_px: f64,
    pub hedge_entry_px: f64,
    pub is_balanced: bool,
}

/// Per-symbol capital allocation emitted by the Portfolio Manager (§4.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAllocation {
    pub symbol: String,
    pub allocated_notional_usd: f64,
    pub priority: usize,
}

/// Residual net exposure measured between the two venues (§4.6). Carries
/// each venue's live size/side alongside the computed drift so
/// `plan_rebalance` can pick a correction side without re-fetching
/// positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionDrift {
    pub symbol: String,
    pub primary_size: f64,
    pub primary_side: Side,
    pub hedge_size: f64,
    pub hedge_side: Side,
    pub drift_quantity: f64,
    pub drift_bps: f64,
    pub needs_rebalance: bool,
}
