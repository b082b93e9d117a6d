//! fab-execution
//!
//! Execution Router and fill Reconciler (spec §4.4, §4.5): dispatches the
//! two legs of a delta-neutral entry or exit in parallel, classifies
//! dispatch failures by which leg caused them, and corrects any fill
//! imbalance with a makeup order on whichever side under-filled.

use fab_schemas::{OrderRequest, OrderResult, Side};
use fab_venue::{VenueAdapter, VenueError};

/// Fill imbalance beyond this fraction of the average fill size triggers a
/// correction order (spec §4.5).
const IMBALANCE_TOLERANCE: f64 = 0.02;

/// The two order requests that make up one delta-neutral leg pair.
#[derive(Clone, Debug, PartialEq)]
pub struct DualLegIntent {
    pub primary: OrderRequest,
    pub hedge: OrderRequest,
}

/// Successful dispatch outcome, including reconciliation verdict.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub primary: OrderResult,
    pub hedge: OrderResult,
    pub is_balanced: bool,
    pub imbalance: f64,
}

/// Which leg a dispatch failure is attributed to. `Parallel` means both
/// legs individually succeeded when retried sequentially, so the original
/// failure can't be pinned on either venue — the caller (the controller,
/// via the Reconciler) decides how to treat the resulting position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailedLeg {
    Primary,
    Hedge,
    Parallel,
}

impl std::fmt::Display for FailedLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedLeg::Primary => write!(f, "primary"),
            FailedLeg::Hedge => write!(f, "hedge"),
            FailedLeg::Parallel => write!(f, "parallel"),
        }
    }
}

/// A dispatch failure, carrying whatever partial fills were confirmed
/// before the failure was detected so the controller can decide what to
/// unwind.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionError {
    pub leg: FailedLeg,
    pub source: VenueError,
    pub primary_partial: Option<OrderResult>,
    pub hedge_partial: Option<OrderResult>,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "execution failed on {} leg: {}", self.leg, self.source)
    }
}

impl std::error::Error for ExecutionError {}

/// Dispatches dual-leg intents against a fixed pair of venue adapters.
pub struct ExecutionRouter<'a> {
    primary: &'a dyn VenueAdapter,
    hedge: &'a dyn VenueAdapter,
    auto_reconcile: bool,
}

impl<'a> ExecutionRouter<'a> {
    pub fn new(primary: &'a dyn VenueAdapter, hedge: &'a dyn VenueAdapter, auto_reconcile: bool) -> Self {
        Self { primary, hedge, auto_reconcile }
    }

    /// Dispatch both legs in parallel. On success, runs fill reconciliation
    /// and — if enabled and the imbalance exceeds tolerance — places a
    /// best-effort makeup order. On dispatch failure, falls back to
    /// sequential placement to identify which leg actually failed (spec
    /// §4.4), best-effort cancelling the primary leg if only the hedge leg
    /// failed.
    pub async fn execute(&self, intent: DualLegIntent) -> Result<ExecutionResult, ExecutionError> {
        let (primary_res, hedge_res) = tokio::join!(
            self.primary.place_order(intent.primary.clone()),
            self.hedge.place_order(intent.hedge.clone()),
        );

        let (primary_result, hedge_result) = match (primary_res, hedge_res) {
            (Ok(primary_result), Ok(hedge_result)) => (primary_result, hedge_result),
            (primary_res, hedge_res) => {
                let original = primary_res
                    .err()
                    .or_else(|| hedge_res.err())
                    .expect("at least one leg failed to reach this branch");
                return Err(self.handle_failure(&intent, original).await);
            }
        };

        let reconciliation = check_fills(
            &primary_result,
            &hedge_result,
            intent.primary.size,
            intent.hedge.size,
            IMBALANCE_TOLERANCE,
        );

        tracing::info!(
            primary_filled = reconciliation.primary_filled,
            hedge_filled = reconciliation.hedge_filled,
            imbalance = reconciliation.imbalance,
            needs_correction = reconciliation.needs_correction,
            "execution.fills"
        );

        if reconciliation.needs_correction && self.auto_reconcile {
            let target = if reconciliation.primary_filled > reconciliation.hedge_filled {
                CorrectionTarget::Hedge
            } else {
                CorrectionTarget::Primary
            };
            let client = match target {
                CorrectionTarget::Primary => self.primary,
                CorrectionTarget::Hedge => self.hedge,
            };
            if let Err(err) = apply_correction(&reconciliation, &intent.primary.symbol, client, target).await {
                tracing::error!(error = %err, "reconciliation_failed");
            }
        }

        Ok(ExecutionResult {
            primary: primary_result,
            hedge: hedge_result,
            is_balanced: !reconciliation.needs_correction,
            imbalance: reconciliation.imbalance,
        })
    }

    async fn handle_failure(&self, intent: &DualLegIntent, original_err: VenueError) -> ExecutionError {
        let primary_result = match self.primary.place_order(intent.primary.clone()).await {
            Ok(result) => result,
            Err(err) => {
                return ExecutionError {
                    leg: FailedLeg::Primary,
                    source: err,
                    primary_partial: None,
                    hedge_partial: None,
                }
            }
        };

        let hedge_result = match self.hedge.place_order(intent.hedge.clone()).await {
            Ok(result) => result,
            Err(err) => {
                self.attempt_cancel(&primary_result).await;
                return ExecutionError {
                    leg: FailedLeg::Hedge,
                    source: err,
                    primary_partial: Some(primary_result),
                    hedge_partial: None,
                };
            }
        };

        ExecutionError {
            leg: FailedLeg::Parallel,
            source: original_err,
            primary_partial: Some(primary_result),
            hedge_partial: Some(hedge_result),
        }
    }

    async fn attempt_cancel(&self, primary_result: &OrderResult) {
        if let Err(err) = self.primary.cancel_order(&primary_result.exchange_order_id).await {
            tracing::warn!(error = %err, order_id = %primary_result.exchange_order_id, "best-effort cancel failed");
        }
    }
}

/// Outcome of comparing actual leg fills against intended sizes (spec
/// §4.5).
#[derive(Clone, Debug, PartialEq)]
pub struct FillReconciliation {
    pub primary_filled: f64,
    pub hedge_filled: f64,
    pub imbalance: f64,
    pub needs_correction: bool,
    pub correction_side: Option<Side>,
    pub correction_size: f64,
}

/// Which venue a correction order is routed to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CorrectionTarget {
    Primary,
    Hedge,
}

impl std::fmt::Display for CorrectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrectionTarget::Primary => write!(f, "primary"),
            CorrectionTarget::Hedge => write!(f, "hedge"),
        }
    }
}

/// Compare actual fills against intended sizes. An imbalance exceeding
/// `tolerance` of the average fill triggers a correction on whichever side
/// still falls short of its intended size. When a side is already at or
/// beyond its intended size the correction reduces it instead.
pub fn check_fills(
    primary_result: &OrderResult,
    hedge_result: &OrderResult,
    intended_primary: f64,
    intended_hedge: f64,
    tolerance: f64,
) -> FillReconciliation {
    let primary_filled = primary_result.filled_size;
    let hedge_filled = hedge_result.filled_size;

    let imbalance = (primary_filled - hedge_filled).abs();
    let avg_filled = (primary_filled + hedge_filled) / 2.0;

    let needs_correction = avg_filled > 0.0 && (imbalance / avg_filled) > tolerance;
    let (correction_side, correction_size) = if needs_correction {
        if primary_filled > hedge_filled {
            let side = if hedge_filled < intended_hedge { Side::Buy } else { Side::Sell };
            (Some(side), imbalance)
        } else {
            let side = if primary_filled < intended_primary { Side::Buy } else { Side::Sell };
            (Some(side), imbalance)
        }
    } else {
        (None, 0.0)
    };

    FillReconciliation {
        primary_filled,
        hedge_filled,
        imbalance,
        needs_correction,
        correction_side,
        correction_size,
    }
}

/// Place the makeup order a reconciliation identified. Callers must only
/// invoke this when `reconciliation.needs_correction` is true.
pub async fn apply_correction(
    reconciliation: &FillReconciliation,
    symbol: &str,
    client: &dyn VenueAdapter,
    target: CorrectionTarget,
) -> Result<OrderResult, VenueError> {
    let side = reconciliation
        .correction_side
        .expect("apply_correction called without a correction side");

    let order = OrderRequest {
        client_id: format!("correction:{target}:{symbol}"),
        symbol: symbol.to_string(),
        side,
        size: reconciliation.correction_size,
        order_type: fab_schemas::OrderType::Market,
        price: None,
        reduce_only: false,
        time_in_force: fab_schemas::TimeInForce::Ioc,
    };

    tracing::warn!(
        symbol = %symbol,
        target = %target,
        side = %side,
        size = reconciliation.correction_size,
        imbalance = reconciliation.imbalance,
        "applying_fill_correction"
    );

    client.place_order(order).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fab_schemas::{OrderType, SymbolSpec, TimeInForce, VenuePosition};
    use fab_venue::PaperVenue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leg(client_id: &str, size: f64, side: Side) -> OrderRequest {
        OrderRequest {
            client_id: client_id.to_string(),
            symbol: "ETH".to_string(),
            side,
            size,
            order_type: OrderType::Market,
            price: Some(2_500.0),
            reduce_only: false,
            time_in_force: TimeInForce::Ioc,
        }
    }

    #[tokio::test]
    async fn balanced_execution_needs_no_correction() {
        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let router = ExecutionRouter::new(&primary, &hedge, true);

        let intent = DualLegIntent {
            primary: leg("primary:ETH:1", 1.0, Side::Sell),
            hedge: leg("hedge:ETH:1", 1.0, Side::Buy),
        };
        let result = router.execute(intent).await.unwrap();

        assert!(result.is_balanced);
        assert_eq!(result.imbalance, 0.0);
    }

    #[tokio::test]
    async fn imbalanced_fill_triggers_correction_on_hedge() {
        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        hedge.set_fill_ratio(0.5);
        let router = ExecutionRouter::new(&primary, &hedge, true);

        let intent = DualLegIntent {
            primary: leg("primary:ETH:2", 1.0, Side::Sell),
            hedge: leg("hedge:ETH:2", 1.0, Side::Buy),
        };
        let result = router.execute(intent).await.unwrap();

        assert!(!result.is_balanced);
        assert_eq!(result.imbalance, 0.5);
        let correction = hedge.order("correction:hedge:ETH").expect("correction order placed");
        assert_eq!(correction.filled_size, 0.5);
    }

    #[tokio::test]
    async fn auto_reconcile_disabled_skips_correction_order() {
        let primary = PaperVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        hedge.set_fill_ratio(0.5);
        let router = ExecutionRouter::new(&primary, &hedge, false);

        let intent = DualLegIntent {
            primary: leg("primary:ETH:3", 1.0, Side::Sell),
            hedge: leg("hedge:ETH:3", 1.0, Side::Buy),
        };
        let result = router.execute(intent).await.unwrap();

        assert!(!result.is_balanced);
        assert!(hedge.order("correction:hedge:ETH").is_none());
    }

    /// A venue double whose `place_order` fails on its first call only,
    /// letting tests exercise the sequential-retry failure path.
    struct FlakyOnceVenue {
        name: String,
        attempts: AtomicUsize,
    }

    impl FlakyOnceVenue {
        fn new(name: &str) -> Self {
            Self { name: name.to_string(), attempts: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl VenueAdapter for FlakyOnceVenue {
        fn name(&self) -> &str {
            &self.name
        }
        async fn get_symbols(&self) -> Result<Vec<SymbolSpec>, VenueError> {
            Ok(Vec::new())
        }
        async fn next_funding(&self, _symbol: &str) -> Result<fab_schemas::FundingSnapshot, VenueError> {
            unimplemented!()
        }
        async fn next_ticker(&self, _symbol: &str) -> Result<fab_schemas::Ticker, VenueError> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
            Ok(Vec::new())
        }
        async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, VenueError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                return Err(VenueError::Transport("simulated drop".to_string()));
            }
            Ok(OrderResult {
                client_id: order.client_id.clone(),
                exchange_order_id: order.client_id,
                status: "filled".to_string(),
                filled_size: order.size,
                average_fill_price: order.price,
            })
        }
        async fn cancel_order(&self, _exchange_order_id: &str) -> Result<(), VenueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn primary_dispatch_failure_is_classified_as_primary_leg() {
        let primary = FlakyOnceVenue::new("primary");
        let hedge = PaperVenue::new("hedge");
        let router = ExecutionRouter::new(&primary, &hedge, true);

        let intent = DualLegIntent {
            primary: leg("primary:ETH:4", 1.0, Side::Sell),
            hedge: leg("hedge:ETH:4", 1.0, Side::Buy),
        };
        let err = router.execute(intent).await.unwrap_err();
        assert_eq!(err.leg, FailedLeg::Primary);
        assert!(err.primary_partial.is_none());
    }

    #[test]
    fn check_fills_below_tolerance_needs_no_correction() {
        let primary = OrderResult {
            client_id: "a".into(),
            exchange_order_id: "a".into(),
            status: "filled".into(),
            filled_size: 1.0,
            average_fill_price: Some(2_500.0),
        };
        let hedge = OrderResult {
            client_id: "b".into(),
            exchange_order_id: "b".into(),
            status: "filled".into(),
            filled_size: 0.995,
            average_fill_price: Some(2_500.0),
        };
        let reconciliation = check_fills(&primary, &hedge, 1.0, 1.0, 0.02);
        assert!(!reconciliation.needs_correction);
    }

    #[test]
    fn check_fills_above_tolerance_picks_buy_for_underfilled_hedge() {
        let primary = OrderResult {
            client_id: "a".into(),
            exchange_order_id: "a".into(),
            status: "filled".into(),
            filled_size: 1.0,
            average_fill_price: Some(2_500.0),
        };
        let hedge = OrderResult {
            client_id: "b".into(),
            exchange_order_id: "b".into(),
            status: "partially_filled".into(),
            filled_size: 0.5,
            average_fill_price: Some(2_500.0),
        };
        let reconciliation = check_fills(&primary, &hedge, 1.0, 1.0, 0.02);
        assert!(reconciliation.needs_correction);
        assert_eq!(reconciliation.correction_side, Some(Side::Buy));
        assert_eq!(reconciliation.correction_size, 0.5);
    }
}
