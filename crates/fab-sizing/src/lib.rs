//! fab-sizing
//!
//! Sizing & Price Coordination (spec §4.3): converts a notional allocation
//! into a lot-rounded base-asset quantity, pulls a synchronized pair of
//! tickers from both venues to derive a cross-venue spread gate, and
//! computes slippage-adjusted limit prices for both legs.

use fab_schemas::{Side, Ticker, SymbolSpec};
use fab_venue::{VenueAdapter, VenueError};

/// Errors from sizing and price coordination.
#[derive(Debug, PartialEq)]
pub enum SizingError {
    /// The reference mid price was zero or negative — cannot size a
    /// quantity from it.
    InvalidMidPrice(f64),
    /// A venue call failed while coordinating prices.
    Venue(VenueError),
}

impl std::fmt::Display for SizingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingError::InvalidMidPrice(mid) => write!(f, "invalid mid price: {mid}"),
            SizingError::Venue(err) => write!(f, "venue error: {err}"),
        }
    }
}

impl std::error::Error for SizingError {}

impl From<VenueError> for SizingError {
    fn from(err: VenueError) -> Self {
        SizingError::Venue(err)
    }
}

/// Coordinated price quote for a symbol, sourced from both venues at
/// (approximately) the same instant, with the cross-venue spread gate
/// already evaluated (spec §4.3).
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatedPrices {
    pub primary_mid: f64,
    pub hedge_mid: f64,
    pub spread_bps: f64,
    pub acceptable: bool,
}

/// Convert `notional_usd` into a base-asset quantity, rounded down to the
/// nearest `lot_size` multiple (spec §4.3: `floor(notional / mid / lot) *
/// lot`, never rounding up since that could exceed the allocated notional).
///
/// `mid_px` must be a positive price; a non-positive value means the
/// caller has no valid quote to size against.
pub fn calculate_quantity(notional_usd: f64, mid_px: f64, spec: &SymbolSpec) -> Result<f64, SizingError> {
    if mid_px <= 0.0 {
        return Err(SizingError::InvalidMidPrice(mid_px));
    }

    let raw_qty = notional_usd / mid_px;
    let lots = (raw_qty / spec.lot_size).floor();
    Ok(lots * spec.lot_size)
}

/// Pull one ticker from each venue and gate on cross-venue spread (spec
/// §4.3): `spread_bps = |primary_mid - hedge_mid| / avg_mid * 10_000`;
/// `acceptable = spread_bps <= max_spread_bps`. Callers must skip entries
/// where `acceptable` is false rather than sizing against a quote that has
/// already diverged too far for both legs to execute meaningfully.
pub async fn get_coordinated_prices(
    symbol: &str,
    primary: &dyn VenueAdapter,
    hedge: &dyn VenueAdapter,
    max_spread_bps: f64,
) -> Result<CoordinatedPrices, SizingError> {
    let primary_ticker: Ticker = primary.next_ticker(symbol).await?;
    let hedge_ticker: Ticker = hedge.next_ticker(symbol).await?;

    let primary_mid = primary_ticker.mid();
    let hedge_mid = hedge_ticker.mid();
    let avg_mid = (primary_mid + hedge_mid) / 2.0;

    let spread_bps = if avg_mid == 0.0 { 0.0 } else { (primary_mid - hedge_mid).abs() / avg_mid * 10_000.0 };

    Ok(CoordinatedPrices {
        primary_mid,
        hedge_mid,
        spread_bps,
        acceptable: spread_bps <= max_spread_bps,
    })
}

/// Derive the slippage-adjusted limit price for each leg (spec §4.3):
/// `factor = 1 + slippage_bps / 10_000`, multiplied by `factor` for a buy
/// (willing to pay up through slippage) and divided by `factor` for a sell
/// (willing to give back through slippage). Results are not tick-rounded
/// here — the venue adapter rounds to its own `tick_size` before submit.
pub fn calculate_limit_prices(
    coords: &CoordinatedPrices,
    is_buy_primary: bool,
    is_buy_hedge: bool,
    slippage_bps: f64,
) -> (f64, f64) {
    let factor = 1.0 + slippage_bps / 10_000.0;

    let primary_px = if is_buy_primary { coords.primary_mid * factor } else { coords.primary_mid / factor };
    let hedge_px = if is_buy_hedge { coords.hedge_mid * factor } else { coords.hedge_mid / factor };

    (primary_px, hedge_px)
}

/// Convenience wrapper deriving both legs' limit prices from a `Side` pair,
/// matching how callers already have `Direction::primary_side`/`hedge_side`
/// on hand rather than raw booleans.
pub fn calculate_limit_prices_for_sides(
    coords: &CoordinatedPrices,
    primary_side: Side,
    hedge_side: Side,
    slippage_bps: f64,
) -> (f64, f64) {
    calculate_limit_prices(coords, primary_side == Side::Buy, hedge_side == Side::Buy, slippage_bps)
}
