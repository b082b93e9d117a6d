//! fab-venue
//!
//! The Venue Adapter capability contract (spec §6.1) and a deterministic
//! in-memory `PaperVenue` test double. Real venue connectors (HTTP/WS
//! clients for specific exchanges) are explicitly out of scope per spec §1
//! — this crate only defines the narrow surface the core controller
//! consumes, plus the double used by tests and by dry-run CLI paths.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fab_schemas::{FundingSnapshot, OrderRequest, OrderResult, SymbolSpec, Ticker, VenuePosition};

/// Errors a venue adapter may surface. The taxonomy mirrors spec §7:
/// transport-class failures are retried upstream by `fab-retry`; semantic
/// failures are not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VenueError {
    /// Connection refused, timed out, or otherwise transport-class. Safe to
    /// retry with backoff.
    Transport(String),
    /// Unknown symbol, rejected price, insufficient margin, or any other
    /// condition the venue considers a permanent rejection. Never retried.
    Semantic(String),
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueError::Transport(msg) => write!(f, "transport error: {msg}"),
            VenueError::Semantic(msg) => write!(f, "semantic error: {msg}"),
        }
    }
}

impl std::error::Error for VenueError {}

impl VenueError {
    /// True for the failure classes `fab-retry`'s transport wrapper should
    /// retry (spec §7, §4.7).
    pub fn is_transport(&self) -> bool {
        matches!(self, VenueError::Transport(_))
    }
}

/// Uniform capability surface over a perpetual futures venue (spec §6.1).
///
/// Streams (`funding_stream`, `ticker_stream`) are modeled as "pull the next
/// item" methods rather than `Stream` objects: spec §6.1 explicitly allows
/// polling a lazy sequence by pulling one item and discarding the rest, and
/// that is the only access pattern the core controller needs.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Short identifier used in log fields and `client_id` construction.
    fn name(&self) -> &str;

    async fn get_symbols(&self) -> Result<Vec<SymbolSpec>, VenueError>;

    /// Pull the next funding snapshot for `symbol`.
    async fn next_funding(&self, symbol: &str) -> Result<FundingSnapshot, VenueError>;

    /// Pull the next ticker for `symbol`.
    async fn next_ticker(&self, symbol: &str) -> Result<Ticker, VenueError>;

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, VenueError>;

    /// Best-effort cancel. Implementations should treat "already filled or
    /// rejected" as success rather than an error — callers (the Execution
    /// Router) swallow cancel errors regardless (spec §4.4).
    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), VenueError>;
}

/// Deterministic in-memory venue used by tests and by `fab-cli`'s dry-run
/// paths when no live credentials are configured. No randomness, no wall
/// clock: fills, ids, and positions are exactly what the caller seeds or
/// what `place_order` deterministically derives from the request.
///
/// `exchange_order_id` is exactly `client_id`, submit is idempotent on
/// `client_id`, and positions are set explicitly rather than simulated.
pub struct PaperVenue {
    name: String,
    symbols: Vec<SymbolSpec>,
    fundings: Mutex<BTreeMap<String, FundingSnapshot>>,
    tickers: Mutex<BTreeMap<String, Ticker>>,
    positions: Mutex<BTreeMap<String, VenuePosition>>,
    orders: Mutex<BTreeMap<String, OrderResult>>,
    /// Next `place_order` call returns this fill ratio (1.0 = full fill).
    /// Lets tests script partial fills deterministically.
    fill_ratio: Mutex<f64>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: Vec::new(),
            fundings: Mutex::new(BTreeMap::new()),
            tickers: Mutex::new(BTreeMap::new()),
            positions: Mutex::new(BTreeMap::new()),
            orders: Mutex::new(BTreeMap::new()),
            fill_ratio: Mutex::new(1.0),
        }
    }

    pub fn with_symbol(mut self, spec: SymbolSpec) -> Self {
        self.symbols.push(spec);
        self
    }

    pub fn set_funding(&self, snapshot: FundingSnapshot) {
        self.fundings.lock().unwrap().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn set_ticker(&self, ticker: Ticker) {
        self.tickers.lock().unwrap().insert(ticker.symbol.clone(), ticker);
    }

    pub fn set_position(&self, position: VenuePosition) {
        self.positions.lock().unwrap().insert(position.symbol.clone(), position);
    }

    pub fn clear_position(&self, symbol: &str) {
        self.positions.lock().unwrap().remove(symbol);
    }

    /// Script the fill ratio the next N `place_order` calls will report
    /// (clamped to `[0.0, 1.0]`). Defaults to `1.0` (always fully filled).
    pub fn set_fill_ratio(&self, ratio: f64) {
        *self.fill_ratio.lock().unwrap() = ratio.clamp(0.0, 1.0);
    }

    /// Look up a previously placed order by `client_id`. Test-facing only.
    pub fn order(&self, client_id: &str) -> Option<OrderResult> {
        self.orders.lock().unwrap().get(client_id).cloned()
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_symbols(&self) -> Result<Vec<SymbolSpec>, VenueError> {
        Ok(self.symbols.clone())
    }

    async fn next_funding(&self, symbol: &str) -> Result<FundingSnapshot, VenueError> {
        self.fundings
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::Semantic(format!("no funding seeded for {symbol}")))
    }

    async fn next_ticker(&self, symbol: &str) -> Result<Ticker, VenueError> {
        self.tickers
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::Semantic(format!("no ticker seeded for {symbol}")))
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(self.positions.lock().unwrap().values().cloned().collect())
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, VenueError> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get(&order.client_id) {
            // Idempotent resubmission: return the prior result unmodified.
            return Ok(existing.clone());
        }

        let fill_ratio = *self.fill_ratio.lock().unwrap();
        let filled_size = order.size * fill_ratio;
        let result = OrderResult {
            client_id: order.client_id.clone(),
            exchange_order_id: order.client_id.clone(),
            status: if fill_ratio >= 1.0 { "filled".to_string() } else { "partially_filled".to_string() },
            filled_size,
            average_fill_price: order.price,
        };
        orders.insert(order.client_id.clone(), result.clone());
        Ok(result)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), VenueError> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get_mut(exchange_order_id) {
            existing.status = "cancelled".to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_schemas::{OrderType, Side, TimeInForce};

    fn order(client_id: &str, size: f64) -> OrderRequest {
        OrderRequest {
            client_id: client_id.to_string(),
            symbol: "ETH".to_string(),
            side: Side::Buy,
            size,
            order_type: OrderType::Market,
            price: Some(2_500.0),
            reduce_only: false,
            time_in_force: TimeInForce::Ioc,
        }
    }

    #[tokio::test]
    async fn place_order_is_idempotent_on_client_id() {
        let venue = PaperVenue::new("primary");
        let first = venue.place_order(order("primary:ETH:1", 1.0)).await.unwrap();
        let second = venue.place_order(order("primary:ETH:1", 1.0)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn scripted_fill_ratio_applies_to_next_orders() {
        let venue = PaperVenue::new("hedge");
        venue.set_fill_ratio(0.5);
        let result = venue.place_order(order("hedge:ETH:2", 2.0)).await.unwrap();
        assert_eq!(result.filled_size, 1.0);
        assert_eq!(result.status, "partially_filled");
    }

    #[tokio::test]
    async fn cancel_marks_order_cancelled() {
        let venue = PaperVenue::new("primary");
        venue.place_order(order("primary:ETH:3", 1.0)).await.unwrap();
        venue.cancel_order("primary:ETH:3").await.unwrap();
        let snapshot = venue.orders.lock().unwrap().get("primary:ETH:3").cloned().unwrap();
        assert_eq!(snapshot.status, "cancelled");
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_not_an_error() {
        let venue = PaperVenue::new("primary");
        assert!(venue.cancel_order("does-not-exist").await.is_ok());
    }

    #[tokio::test]
    async fn missing_ticker_is_semantic_error() {
        let venue = PaperVenue::new("primary");
        let err = venue.next_ticker("ETH").await.unwrap_err();
        assert!(!err.is_transport());
    }
}
