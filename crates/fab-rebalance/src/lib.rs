//! fab-rebalance
//!
//! Rebalancer (spec §4.6): detects residual net exposure in an open
//! delta-neutral position and plans a corrective order. Corrections are
//! always routed to the hedge venue — a deliberate simplification flagged
//! in the design notes rather than an oversight: the primary venue carries
//! the funding-collecting leg and is left untouched so the position's
//! funding economics don't shift mid-rebalance.

use fab_schemas::{PositionDrift, Side, VenueName, VenuePosition};
use fab_venue::{VenueAdapter, VenueError};

/// A planned corrective order on the hedge venue.
#[derive(Clone, Debug, PartialEq)]
pub struct RebalanceAction {
    pub symbol: String,
    pub venue: VenueName,
    pub side: Side,
    pub quantity: f64,
}

/// Measure residual net exposure between the two venues' *live* positions
/// (spec §4.6: "the controller fetches both venues' positions"; GLOSSARY:
/// drift includes exposure "caused by ... independent venue fills"). Takes
/// `VenuePosition`, not the controller's stored fill record, so drift that
/// develops after entry — partial closes, liquidations, independent fills —
/// is visible on the next rebalance pass. Returns `None` when either side
/// carries zero size (nothing to measure against) or the drift falls below
/// `drift_threshold_bps`.
pub fn detect_drift(
    symbol: &str,
    primary_position: &VenuePosition,
    hedge_position: &VenuePosition,
    drift_threshold_bps: f64,
) -> Option<PositionDrift> {
    let primary_signed = signed_exposure(primary_position);
    let hedge_signed = signed_exposure(hedge_position);

    let total_exposure = primary_signed + hedge_signed;
    let avg_size = (primary_signed.abs() + hedge_signed.abs()) / 2.0;

    if avg_size == 0.0 {
        return None;
    }

    let drift_bps = (total_exposure / avg_size).abs() * 10_000.0;
    let needs_rebalance = drift_bps >= drift_threshold_bps;

    if !needs_rebalance {
        return None;
    }

    Some(PositionDrift {
        symbol: symbol.to_string(),
        primary_size: primary_position.size,
        primary_side: primary_position.side,
        hedge_size: hedge_position.size,
        hedge_side: hedge_position.side,
        drift_quantity: total_exposure.abs(),
        drift_bps,
        needs_rebalance,
    })
}

fn signed_exposure(position: &VenuePosition) -> f64 {
    position.size * position.side.sign()
}

/// Plan the corrective action for a detected drift. A net-long position
/// (positive total exposure) sells on the hedge venue to bring the sum back
/// toward zero; a net-short position buys. Self-contained on `drift` alone
/// since it already carries each venue's signed size/side.
pub fn plan_rebalance(drift: &PositionDrift) -> RebalanceAction {
    let primary_signed = drift.primary_size * drift.primary_side.sign();
    let hedge_signed = drift.hedge_size * drift.hedge_side.sign();
    let total_exposure = primary_signed + hedge_signed;

    let side = if total_exposure > 0.0 { Side::Sell } else { Side::Buy };

    RebalanceAction {
        symbol: drift.symbol.clone(),
        venue: VenueName::Hedge,
        side,
        quantity: drift.drift_quantity,
    }
}

/// Submit the planned rebalance order to the hedge venue at `limit_price`.
pub async fn execute_rebalance(
    action: &RebalanceAction,
    hedge: &dyn VenueAdapter,
    limit_price: f64,
) -> Result<fab_schemas::OrderResult, VenueError> {
    let order = fab_schemas::OrderRequest {
        client_id: format!("rebalance:hedge:{}", action.symbol),
        symbol: action.symbol.clone(),
        side: action.side,
        size: action.quantity,
        order_type: fab_schemas::OrderType::Limit,
        price: Some(limit_price),
        reduce_only: false,
        time_in_force: fab_schemas::TimeInForce::Ioc,
    };

    tracing::info!(
        symbol = %action.symbol,
        venue = %action.venue,
        side = %action.side,
        quantity = action.quantity,
        "rebalance_executing"
    );

    hedge.place_order(order).await
}
