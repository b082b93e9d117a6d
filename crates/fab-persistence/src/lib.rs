//! fab-persistence
//!
//! Crash-recoverable state for the trade-lifecycle controller (spec §4.7,
//! §6.2): open positions and the PnL ledger are both written as whole-file
//! JSON replacements, so a crash mid-write never leaves a torn file behind
//! — the writer always lands its output in a temp file in the same
//! directory and renames it over the target, which is atomic on the same
//! filesystem.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fab_schemas::{Position, Side, VenueName};
use serde::{Deserialize, Serialize};

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Persists the controller's open-position map for crash recovery.
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, positions: &BTreeMap<String, Position>) {
        if let Err(err) = atomic_write_json(&self.path, positions) {
            tracing::error!(error = %err, path = %self.path.display(), "position_save_failed");
        }
    }

    /// Load persisted positions. Returns an empty map if the file doesn't
    /// exist or fails to parse — a corrupt position file is never fatal,
    /// only a loss of recovered state, and is logged as a critical event so
    /// an operator can investigate.
    pub fn load(&self) -> BTreeMap<String, Position> {
        let body = match std::fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                tracing::error!(error = %err, path = %self.path.display(), "position_load_failed");
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&body) {
            Ok(positions) => positions,
            Err(err) => {
                tracing::error!(error = %err, path = %self.path.display(), "position_file_corrupt");
                BTreeMap::new()
            }
        }
    }

    pub fn clear(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::error!(error = %err, path = %self.path.display(), "position_clear_failed");
            }
        }
    }
}

/// Single trade execution record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp_ms: i64,
    pub symbol: String,
    pub venue: VenueName,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub is_entry: bool,
}

/// Single funding payment record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub timestamp_ms: i64,
    pub symbol: String,
    pub venue: VenueName,
    pub rate_bps: f64,
    pub payment_usd: f64,
    pub position_size: f64,
}

/// PnL breakdown for one open position at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionPnl {
    pub symbol: String,
    pub entry_value_usd: f64,
    pub current_value_usd: f64,
    pub unrealized_pnl: f64,
    pub funding_earned: f64,
    pub fees_paid: f64,
    pub net_pnl: f64,
}

/// Aggregate PnL across all positions tracked by the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TotalPnl {
    pub realized_pnl: f64,
    pub total_funding: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PnlLedgerState {
    trades: Vec<TradeRecord>,
    funding_payments: Vec<FundingPayment>,
    total_fees: f64,
    total_funding: f64,
    realized_pnl: f64,
}

/// Tracks realized/unrealized PnL, funding income, and fees across the
/// lifetime of the bot. Every mutation immediately persists the full
/// ledger to disk.
pub struct PnlLedger {
    path: PathBuf,
    state: PnlLedgerState,
}

impl PnlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_else(|err| {
                tracing::error!(error = %err, path = %path.display(), "pnl_ledger_corrupt");
                PnlLedgerState::default()
            }),
            Err(_) => PnlLedgerState::default(),
        };
        Self { path, state }
    }

    pub fn record_trade(&mut self, record: TradeRecord) {
        self.state.total_fees += record.fee;
        self.state.trades.push(record);
        self.persist();
    }

    pub fn record_funding(&mut self, payment: FundingPayment) {
        self.state.total_funding += payment.payment_usd;
        self.state.funding_payments.push(payment);
        self.persist();
    }

    /// Add to realized PnL on a confirmed exit (not itself derivable from
    /// trade/funding records, since realized PnL depends on entry cost
    /// basis the ledger doesn't track per-position).
    pub fn record_realized(&mut self, amount: f64) {
        self.state.realized_pnl += amount;
        self.persist();
    }

    /// Compute current PnL for an open position from live entry/current
    /// prices and signed quantities (+ long, - short), summing every
    /// recorded funding payment and fee for the symbol.
    pub fn calculate_position_pnl(
        &self,
        symbol: &str,
        primary_entry_px: f64,
        primary_current_px: f64,
        primary_qty_signed: f64,
        hedge_entry_px: f64,
        hedge_current_px: f64,
        hedge_qty_signed: f64,
    ) -> PositionPnl {
        let primary_pnl = (primary_current_px - primary_entry_px) * primary_qty_signed;
        let hedge_pnl = (hedge_current_px - hedge_entry_px) * hedge_qty_signed;
        let unrealized = primary_pnl + hedge_pnl;

        let symbol_funding: f64 = self
            .state
            .funding_payments
            .iter()
            .filter(|f| f.symbol == symbol)
            .map(|f| f.payment_usd)
            .sum();
        let symbol_fees: f64 = self.state.trades.iter().filter(|t| t.symbol == symbol).map(|t| t.fee).sum();

        let net_pnl = unrealized + symbol_funding - symbol_fees;
        let entry_value = (primary_entry_px * primary_qty_signed).abs() + (hedge_entry_px * hedge_qty_signed).abs();
        let current_value =
            (primary_current_px * primary_qty_signed).abs() + (hedge_current_px * hedge_qty_signed).abs();

        PositionPnl {
            symbol: symbol.to_string(),
            entry_value_usd: entry_value,
            current_value_usd: current_value,
            unrealized_pnl: unrealized,
            funding_earned: symbol_funding,
            fees_paid: symbol_fees,
            net_pnl,
        }
    }

    pub fn total_pnl(&self) -> TotalPnl {
        TotalPnl {
            realized_pnl: self.state.realized_pnl,
            total_funding: self.state.total_funding,
            total_fees: self.state.total_fees,
            net_pnl: self.state.realized_pnl + self.state.total_funding - self.state.total_fees,
        }
    }

    fn persist(&self) {
        if let Err(err) = atomic_write_json(&self.path, &self.state) {
            tracing::error!(error = %err, path = %self.path.display(), "pnl_save_failed");
        }
    }
}
