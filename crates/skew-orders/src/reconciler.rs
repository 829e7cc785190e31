//! Order reconciliation.
//!
//! Compares resting orders against what the current quote and exposure
//! call for, and repairs the difference:
//!
//! ```text
//! Idle → Diffing ──► NoOp ─────────────────────────────► Idle
//!            │
//!            └──► Cancelling → Placing → Watching ─────► Idle
//! ```
//!
//! Passes are serialized by an async mutex, so a pass triggered while
//! another is running waits and then re-evaluates fresh state.
//!
//! Before a mismatch touches watched orders the fill watcher is settled:
//! fills the order stream missed are detected, state is reloaded, and the
//! pass re-evaluates against the post-fill exposure.
//!
//! Without the incremental planner a mismatch cancels every order for the
//! symbol and re-places the full desired set concurrently. With the planner
//! only the orders that moved are touched.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use skew_core::{
    InstrumentSpec, MetricsSink, NoopSink, Order, OrderIntent, OrderRequest, OrderSide, Price,
    Size,
};
use skew_quote::{
    compute_quote, volatility_factor, InventoryExposure, Quote, QuoteConfig, VolatilityTracker,
};

use crate::config::EngineConfig;
use crate::desired::{check_orders, compute_desired_orders, MatchOutcome};
use crate::error::{EngineError, EngineResult, GatewayError, GatewayResult};
use crate::fill_watcher::{last_fill_price, FillWatcher};
use crate::gateway::DynGateway;
use crate::planner::{GridTarget, IncrementalOrderPlanner};
use crate::sizing::compute_order_amount;
use crate::state::{EngineSnapshot, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Normal,
    /// Issued by the recovery coordinator; failures go back to it.
    Recovery,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Idle,
    Diffing,
    Cancelling,
    Placing,
    Watching,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing could be evaluated (e.g. no basis price yet).
    Skipped(&'static str),
    /// Live orders already match.
    NoOp,
    Executed { placed: usize, cancelled: usize },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::NoOp => "noop",
            Self::Executed { .. } => "executed",
        }
    }
}

struct Evaluation {
    quote: Quote,
    desired: Vec<OrderIntent>,
    check: MatchOutcome,
}

/// Keeps one instrument's resting orders in line with its quote.
pub struct OrderReconciler {
    symbol: String,
    instrument: InstrumentSpec,
    engine: EngineConfig,
    quote: QuoteConfig,
    gateway: DynGateway,
    state: Arc<StateStore>,
    volatility: Arc<RwLock<VolatilityTracker>>,
    watcher: Arc<FillWatcher>,
    /// Held for the whole pass; owns the planner when enabled.
    cycle: tokio::sync::Mutex<Option<IncrementalOrderPlanner>>,
    phase: Mutex<ReconcilePhase>,
    metrics: Arc<dyn MetricsSink>,
}

impl OrderReconciler {
    pub fn new(
        instrument: InstrumentSpec,
        engine: EngineConfig,
        quote: QuoteConfig,
        gateway: DynGateway,
        state: Arc<StateStore>,
        volatility: Arc<RwLock<VolatilityTracker>>,
        watcher: Arc<FillWatcher>,
    ) -> EngineResult<Self> {
        let planner = if engine.incremental_enabled {
            Some(IncrementalOrderPlanner::new(
                instrument.symbol.clone(),
                instrument.tick_size,
                engine.grid_interval.map(Price::new),
            )?)
        } else {
            None
        };

        Ok(Self {
            symbol: instrument.symbol.clone(),
            instrument,
            engine,
            quote,
            gateway,
            state,
            volatility,
            watcher,
            cycle: tokio::sync::Mutex::new(planner),
            phase: Mutex::new(ReconcilePhase::Idle),
            metrics: Arc::new(NoopSink),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn phase(&self) -> ReconcilePhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ReconcilePhase) {
        *self.phase.lock() = phase;
    }

    /// Reload balance, positions, open orders and ticker from the exchange.
    pub async fn refresh_state(&self) -> EngineResult<()> {
        let (balance, positions, open_orders, ticker) = tokio::try_join!(
            self.gateway.fetch_balance(&self.engine.coin),
            self.gateway.fetch_positions(&self.symbol),
            self.gateway.fetch_open_orders(&self.symbol),
            self.gateway.fetch_ticker(&self.symbol),
        )?;

        self.state.apply_balance(balance);
        self.state.apply_positions(&positions);
        self.state.replace_open_orders(open_orders);
        self.state.apply_ticker(ticker.last);
        debug!(
            symbol = %self.symbol,
            free = %balance.free,
            total = %balance.total,
            last = %ticker.last,
            "State refreshed"
        );
        Ok(())
    }

    /// Replace cached open orders with the exchange's list.
    ///
    /// Takes the pass lock, so it never races the placements of a pass.
    pub async fn sync_open_orders(&self) -> EngineResult<Vec<Order>> {
        let _cycle = self.cycle.lock().await;
        let open = self.gateway.fetch_open_orders(&self.symbol).await?;
        self.state.replace_open_orders(open.clone());
        Ok(open)
    }

    /// Put live orders back under fill watch.
    pub fn register_live_orders(&self) {
        self.watcher.register(&self.state.snapshot().open_orders);
    }

    /// Quote for the current snapshot, if a basis price is known.
    pub fn current_quote(&self) -> Option<Quote> {
        let snapshot = self.state.snapshot();
        let basis = snapshot.basis_price(self.engine.use_transaction_price_basis)?;
        Some(self.quote_for(&snapshot, basis))
    }

    fn quote_for(&self, snapshot: &EngineSnapshot, basis: Price) -> Quote {
        let exposure = InventoryExposure::from_view(&snapshot.positions, &snapshot.account);
        let factor = self
            .volatility
            .read()
            .volatility()
            .map(|v| volatility_factor(v, &self.quote));
        compute_quote(&self.quote, self.engine.direction, &exposure, basis, factor)
    }

    /// Allowed relative drift of a live order from its quote price.
    fn tolerance(&self, basis: Price, grid: Option<Price>) -> Decimal {
        let base = self.engine.price_deviation_factor * self.quote.base_spread;
        match grid {
            Some(g) if basis.is_positive() => base + g.inner() / basis.inner(),
            _ => base,
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self, mode: ReconcileMode) -> EngineResult<ReconcileOutcome> {
        let mut cycle = self.cycle.lock().await;
        self.set_phase(ReconcilePhase::Diffing);
        let result = self.reconcile_locked(mode, cycle.as_mut()).await;
        self.set_phase(ReconcilePhase::Idle);
        drop(cycle);
        self.flush_settled();

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        self.metrics.reconcile(&self.symbol, mode.as_str(), label);
        result
    }

    async fn reconcile_locked(
        &self,
        mode: ReconcileMode,
        planner: Option<&mut IncrementalOrderPlanner>,
    ) -> EngineResult<ReconcileOutcome> {
        let grid = planner.as_ref().map(|p| p.grid_interval());
        let mut snapshot = self.state.snapshot();
        let Some(mut basis) = snapshot.basis_price(self.engine.use_transaction_price_basis) else {
            warn!(
                symbol = %self.symbol,
                mode = mode.as_str(),
                "No basis price, skipping reconciliation"
            );
            return Ok(ReconcileOutcome::Skipped("no basis price"));
        };

        let mut eval = self.evaluate(&snapshot, basis, grid);
        if !eval.check.is_match() && self.settle_fills().await? {
            snapshot = self.state.snapshot();
            let Some(settled) = snapshot.basis_price(self.engine.use_transaction_price_basis)
            else {
                return Ok(ReconcileOutcome::Skipped("no basis price"));
            };
            basis = settled;
            eval = self.evaluate(&snapshot, basis, grid);
        }

        let Evaluation {
            quote,
            desired,
            check,
        } = eval;
        self.metrics.spreads(
            &self.symbol,
            quote.buy_spread.to_f64().unwrap_or_default(),
            quote.sell_spread.to_f64().unwrap_or_default(),
        );
        if check.is_match() {
            self.watcher.register(&snapshot.open_orders);
            debug!(
                symbol = %self.symbol,
                live = snapshot.open_orders.len(),
                basis = %basis,
                "Orders match quote"
            );
            return Ok(ReconcileOutcome::NoOp);
        }

        let amount = compute_order_amount(
            snapshot.account.equity,
            basis,
            self.engine.order_amount_ratio,
            &self.instrument,
            self.engine.min_order_notional,
        );
        info!(
            symbol = %self.symbol,
            mode = mode.as_str(),
            reason = ?check,
            basis = %basis,
            buy_price = %quote.buy_price,
            sell_price = %quote.sell_price,
            buy_spread = %quote.buy_spread,
            sell_spread = %quote.sell_spread,
            amount = %amount,
            "Reconciling orders"
        );

        match planner {
            Some(planner) => {
                self.apply_incremental(planner, &snapshot, &desired, &quote, amount)
                    .await
            }
            None => self.apply_full(&snapshot, &desired, &quote, amount).await,
        }
    }

    fn evaluate(&self, snapshot: &EngineSnapshot, basis: Price, grid: Option<Price>) -> Evaluation {
        let quote = self.quote_for(snapshot, basis);
        let desired = compute_desired_orders(
            self.engine.direction,
            snapshot.positions.long_size,
            snapshot.positions.short_size,
        );
        let check = check_orders(
            &snapshot.open_orders,
            &desired,
            &quote,
            self.tolerance(basis, grid),
        );
        Evaluation {
            quote,
            desired,
            check,
        }
    }

    /// Detect fills the stream missed before watched orders are cancelled.
    ///
    /// Returns true when fills were found and state was reloaded. The fills
    /// are notified after the pass releases its lock.
    async fn settle_fills(&self) -> EngineResult<bool> {
        if !self.watcher.is_active() && self.watcher.cancelling() == 0 {
            return Ok(false);
        }
        let fills = self.watcher.settle(self.gateway.as_ref()).await?;
        if fills.is_empty() {
            return Ok(false);
        }
        if let Some(price) = last_fill_price(&fills) {
            self.state.record_fill_price(price);
        }
        self.refresh_state().await?;
        info!(
            symbol = %self.symbol,
            fills = fills.len(),
            "Fills settled before reconciling"
        );
        Ok(true)
    }

    /// Notify fills settled during a pass.
    ///
    /// Spawned: the sink may wait on the trigger queue the caller drains.
    fn flush_settled(&self) {
        if !self.watcher.has_pending() {
            return;
        }
        let watcher = self.watcher.clone();
        let symbol = self.symbol.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.flush().await {
                warn!(symbol = %symbol, error = %e, "Settled fill notification deferred");
            }
        });
    }

    fn order_request(&self, intent: &OrderIntent, quote: &Quote, amount: Size) -> OrderRequest {
        let raw = quote.price_for(intent.side);
        let price = match intent.side {
            OrderSide::Buy => raw.floor_to_tick(self.instrument.tick_size),
            OrderSide::Sell => raw.ceil_to_tick(self.instrument.tick_size),
        };
        OrderRequest {
            symbol: self.symbol.clone(),
            side: intent.side,
            price,
            amount,
            reduce_only: intent.reduce_only,
        }
    }

    /// Cancel everything, then place the full desired set concurrently.
    async fn apply_full(
        &self,
        snapshot: &EngineSnapshot,
        desired: &[OrderIntent],
        quote: &Quote,
        amount: Size,
    ) -> EngineResult<ReconcileOutcome> {
        self.set_phase(ReconcilePhase::Cancelling);
        self.watcher.forget_all();
        self.gateway.cancel_all_orders(&self.symbol).await?;
        let cancelled = snapshot.open_orders.len();
        self.state.replace_open_orders(Vec::new());

        self.set_phase(ReconcilePhase::Placing);
        let requests: Vec<OrderRequest> = desired
            .iter()
            .map(|intent| self.order_request(intent, quote, amount))
            .collect();
        let results = join_all(
            requests
                .into_iter()
                .map(|request| self.gateway.create_order(request)),
        )
        .await;

        self.finish(results, cancelled)
    }

    /// Cancel and place only what the planner says changed.
    async fn apply_incremental(
        &self,
        planner: &mut IncrementalOrderPlanner,
        snapshot: &EngineSnapshot,
        desired: &[OrderIntent],
        quote: &Quote,
        amount: Size,
    ) -> EngineResult<ReconcileOutcome> {
        let targets: Vec<GridTarget> = desired
            .iter()
            .map(|intent| GridTarget {
                side: intent.side,
                reduce_only: intent.reduce_only,
                price: quote.price_for(intent.side),
                amount,
            })
            .collect();
        let plan = planner.plan(&snapshot.open_orders, &targets)?;
        let stats = planner.stats();
        self.metrics.planner_stats(
            &self.symbol,
            stats.total_updates,
            stats.action_updates,
            stats.operations_saved,
        );

        if plan.is_empty() {
            self.watcher.register(&snapshot.open_orders);
            return Ok(ReconcileOutcome::NoOp);
        }

        self.set_phase(ReconcilePhase::Cancelling);
        self.watcher.forget(&plan.orders_to_cancel);
        self.set_phase(ReconcilePhase::Placing);
        let report = planner.execute(self.gateway.as_ref(), &plan).await;

        self.set_phase(ReconcilePhase::Watching);
        self.state.remove_orders(&report.cancelled);
        self.watcher.register(&report.placed);
        self.state.apply_order_updates(&report.placed);
        self.metrics
            .orders_churned(&self.symbol, report.placed.len(), report.cancelled.len());

        info!(
            symbol = %self.symbol,
            placed = report.placed.len(),
            cancelled = report.cancelled.len(),
            failed = report.failures.len(),
            kept = plan.kept,
            saved = stats.operations_saved,
            "Incremental update applied"
        );

        let total = report.total();
        if report.is_success() {
            return Ok(ReconcileOutcome::Executed {
                placed: report.placed.len(),
                cancelled: report.cancelled.len(),
            });
        }
        if report.failures.len() == total {
            return Err(dominant_error(report.failures).into());
        }
        Err(EngineError::PartialFailure {
            failed: report.failures.len(),
            total,
        })
    }

    fn finish(
        &self,
        results: Vec<GatewayResult<Order>>,
        cancelled: usize,
    ) -> EngineResult<ReconcileOutcome> {
        self.set_phase(ReconcilePhase::Watching);
        let total = results.len();
        let (placed, failures): (Vec<Order>, Vec<GatewayError>) =
            results
                .into_iter()
                .fold((Vec::new(), Vec::new()), |(mut ok, mut err), result| {
                    match result {
                        Ok(order) => ok.push(order),
                        Err(e) => err.push(e),
                    }
                    (ok, err)
                });

        self.watcher.register(&placed);
        self.state.apply_order_updates(&placed);
        self.metrics
            .orders_churned(&self.symbol, placed.len(), cancelled);

        for order in &placed {
            info!(
                symbol = %self.symbol,
                order_id = %order.id,
                side = %order.side,
                price = %order.price,
                amount = %order.amount,
                reduce_only = order.reduce_only,
                "Order placed"
            );
        }
        for e in &failures {
            warn!(symbol = %self.symbol, error = %e, kind = e.kind(), "Order placement failed");
        }

        if failures.is_empty() {
            return Ok(ReconcileOutcome::Executed {
                placed: placed.len(),
                cancelled,
            });
        }
        if placed.is_empty() {
            return Err(dominant_error(failures).into());
        }
        Err(EngineError::PartialFailure {
            failed: failures.len(),
            total,
        })
    }

    /// Cancel every resting order, used on shutdown.
    pub async fn cancel_all(&self) -> EngineResult<()> {
        let _cycle = self.cycle.lock().await;
        self.watcher.forget_all();
        self.gateway.cancel_all_orders(&self.symbol).await?;
        self.state.replace_open_orders(Vec::new());
        info!(symbol = %self.symbol, "All orders cancelled");
        Ok(())
    }
}

/// Network failures dominate; otherwise the first failure is reported.
fn dominant_error(mut failures: Vec<GatewayError>) -> GatewayError {
    match failures.iter().position(GatewayError::is_network) {
        Some(i) => failures.swap_remove(i),
        None if !failures.is_empty() => failures.swap_remove(0),
        None => GatewayError::Other("no operations".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill_watcher::{FillBatch, FillSink, FillWatchConfig};
    use crate::gateway::{BoxFuture, ExchangeGateway};
    use crate::simulated::{SimulatedGateway, SimulatedMarket};
    use rust_decimal_macros::dec;
    use skew_core::PositionSide;
    use skew_quote::VolatilityConfig;

    struct DropSink;

    impl FillSink for DropSink {
        fn notify(&self, _batch: FillBatch) -> BoxFuture<'_, EngineResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        gateway: Arc<SimulatedGateway>,
        state: Arc<StateStore>,
        watcher: Arc<FillWatcher>,
        reconciler: OrderReconciler,
    }

    fn quote_config() -> QuoteConfig {
        QuoteConfig {
            min_spread: dec!(0.001),
            base_spread: dec!(0.002),
            max_spread: dec!(0.004),
            ..Default::default()
        }
    }

    async fn harness(engine: EngineConfig) -> Harness {
        let gateway = Arc::new(SimulatedGateway::new(SimulatedMarket::new(
            "BTC/USDT",
            dec!(100),
            dec!(1000),
        )));
        let instrument = gateway.load_instrument("BTC/USDT").await.unwrap();
        let state = Arc::new(StateStore::new("BTC/USDT"));
        let watcher = Arc::new(FillWatcher::new(
            "BTC/USDT",
            FillWatchConfig::default(),
            Arc::new(DropSink),
        ));
        let volatility = Arc::new(RwLock::new(VolatilityTracker::new(
            "BTC/USDT",
            VolatilityConfig::default(),
        )));
        let reconciler = OrderReconciler::new(
            instrument,
            EngineConfig {
                use_transaction_price_basis: false,
                ..engine
            },
            quote_config(),
            gateway.clone(),
            state.clone(),
            volatility,
            watcher.clone(),
        )
        .unwrap();
        Harness {
            gateway,
            state,
            watcher,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_initial_pass_places_desired_orders() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Executed {
                placed: 2,
                cancelled: 0
            }
        );

        let created = h.gateway.created_orders();
        let buy = created.iter().find(|r| r.side == OrderSide::Buy).unwrap();
        let sell = created.iter().find(|r| r.side == OrderSide::Sell).unwrap();
        // flat: both sides at min spread around the last price
        assert_eq!(buy.price, Price::new(dec!(99.9)));
        assert_eq!(sell.price, Price::new(dec!(100.1)));
        assert_eq!(buy.amount, Size::new(dec!(0.5)));
        assert_eq!(h.watcher.watched(), 2);
        assert_eq!(h.state.snapshot().open_orders.len(), 2);
        assert_eq!(h.reconciler.phase(), ReconcilePhase::Idle);
    }

    #[tokio::test]
    async fn test_matching_orders_are_left_alone() {
        let h = harness(EngineConfig::default()).await;
        h.gateway
            .seed_order(OrderSide::Buy, Price::new(dec!(99.9)), Size::new(dec!(0.5)), false);
        h.gateway
            .seed_order(OrderSide::Sell, Price::new(dec!(100.1)), Size::new(dec!(0.5)), false);
        h.reconciler.refresh_state().await.unwrap();

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoOp);
        assert!(h.gateway.created_orders().is_empty());
        assert_eq!(h.gateway.cancel_calls(), 0);
        assert!(h.watcher.is_active());
    }

    #[tokio::test]
    async fn test_position_adds_close_order() {
        let h = harness(EngineConfig::default()).await;
        h.gateway.seed_position(PositionSide::Long, dec!(1), dec!(100));
        h.reconciler.refresh_state().await.unwrap();

        h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        let created = h.gateway.created_orders();
        assert_eq!(created.len(), 3);
        assert_eq!(created.iter().filter(|r| r.reduce_only).count(), 1);
    }

    #[tokio::test]
    async fn test_no_basis_skips() {
        let h = harness(EngineConfig::default()).await;
        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_partial_failure_is_recoverable() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();
        h.gateway
            .fail_next_create(GatewayError::Exchange("rejected".to_string()));

        let err = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap_err();
        assert!(matches!(err, EngineError::PartialFailure { failed: 1, total: 2 }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_all_failed_reports_network_first() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();
        h.gateway
            .fail_next_create(GatewayError::Exchange("rejected".to_string()));
        h.gateway
            .fail_next_create(GatewayError::Network("timeout".to_string()));

        let err = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap_err();
        assert!(matches!(err, EngineError::Gateway(GatewayError::Network(_))));
    }

    #[tokio::test]
    async fn test_all_rejected_is_not_recoverable() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();
        for _ in 0..2 {
            h.gateway
                .fail_next_create(GatewayError::Exchange("rejected".to_string()));
        }

        let err = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_incremental_replaces_only_drifted_order() {
        let h = harness(EngineConfig {
            incremental_enabled: true,
            ..Default::default()
        })
        .await;
        let drifted = h
            .gateway
            .seed_order(OrderSide::Buy, Price::new(dec!(99)), Size::new(dec!(0.5)), false);
        h.gateway
            .seed_order(OrderSide::Sell, Price::new(dec!(100.1)), Size::new(dec!(0.5)), false);
        h.reconciler.refresh_state().await.unwrap();

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Executed {
                placed: 1,
                cancelled: 1
            }
        );
        let created = h.gateway.created_orders();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].price, Price::new(dec!(99.9)));
        assert!(h.gateway.open_orders().iter().all(|o| o.id != drifted.id));

        // Unchanged inputs: nothing to do.
        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoOp);
        assert_eq!(h.gateway.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_incremental_refills_missing_side() {
        let h = harness(EngineConfig {
            incremental_enabled: true,
            ..Default::default()
        })
        .await;
        h.reconciler.refresh_state().await.unwrap();
        h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(h.gateway.created_orders().len(), 2);

        let sell = h
            .gateway
            .open_orders()
            .into_iter()
            .find(|o| o.side == OrderSide::Sell)
            .unwrap();
        h.gateway.cancel_order(&sell.id, "BTC/USDT").await.unwrap();
        h.reconciler.refresh_state().await.unwrap();

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Executed {
                placed: 1,
                cancelled: 0
            }
        );
        assert_eq!(h.gateway.open_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_plan_converges_on_grid() {
        let h = harness(EngineConfig {
            incremental_enabled: true,
            grid_interval: Some(dec!(0.5)),
            ..Default::default()
        })
        .await;
        h.reconciler.refresh_state().await.unwrap();

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Executed {
                placed: 2,
                cancelled: 0
            }
        );
        let live = h.gateway.open_orders();
        let buy = live.iter().find(|o| o.side == OrderSide::Buy).unwrap();
        let sell = live.iter().find(|o| o.side == OrderSide::Sell).unwrap();
        assert_eq!(buy.price, Price::new(dec!(99.5)));
        assert_eq!(sell.price, Price::new(dec!(100.5)));

        // Grid-snapped orders satisfy the same check the next pass runs.
        let quote = h.reconciler.current_quote().unwrap();
        let desired = compute_desired_orders(h.reconciler.engine.direction, dec!(0), dec!(0));
        let tolerance = h
            .reconciler
            .tolerance(quote.basis_price, Some(Price::new(dec!(0.5))));
        assert!(crate::desired::orders_match_desired(
            &live, &desired, &quote, tolerance
        ));

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoOp);
        assert_eq!(h.gateway.created_orders().len(), 2);
        assert_eq!(h.gateway.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_missed_fill_settled_before_cancel() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();
        h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();

        // The buy at 99.9 fills without an order event.
        h.gateway.set_silent_fills(true);
        h.gateway.set_price(Price::new(dec!(99.8)));
        // A stale price move makes the pass want to cancel everything.
        h.state.apply_ticker(Price::new(dec!(99)));

        let outcome = h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Executed {
                placed: 3,
                cancelled: 1
            }
        );
        let snapshot = h.state.snapshot();
        assert_eq!(snapshot.last_fill_price, Some(Price::new(dec!(99.9))));
        assert_eq!(snapshot.positions.long_size, dec!(0.5));
        let created = h.gateway.created_orders();
        assert_eq!(created.iter().skip(2).filter(|r| r.reduce_only).count(), 1);

        tokio::task::yield_now().await;
        assert!(!h.watcher.has_pending());
    }

    #[tokio::test]
    async fn test_sync_open_orders_replaces_cache() {
        let h = harness(EngineConfig::default()).await;
        h.gateway
            .seed_order(OrderSide::Buy, Price::new(dec!(99.9)), Size::new(dec!(0.5)), false);
        assert!(h.state.snapshot().open_orders.is_empty());

        let open = h.reconciler.sync_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(h.state.snapshot().open_orders, open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_open_orders_waits_for_pass() {
        let h = harness(EngineConfig::default()).await;
        let pass = h.reconciler.cycle.lock().await;

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            h.reconciler.sync_open_orders(),
        )
        .await;
        assert!(waited.is_err());

        drop(pass);
        assert!(h.reconciler.sync_open_orders().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all_clears_watch() {
        let h = harness(EngineConfig::default()).await;
        h.reconciler.refresh_state().await.unwrap();
        h.reconciler.reconcile(ReconcileMode::Normal).await.unwrap();

        h.reconciler.cancel_all().await.unwrap();
        assert!(h.gateway.open_orders().is_empty());
        assert!(!h.watcher.is_active());
    }

    #[test]
    fn test_dominant_error() {
        let err = dominant_error(vec![
            GatewayError::Exchange("a".into()),
            GatewayError::Network("b".into()),
        ]);
        assert!(err.is_network());
        let err = dominant_error(vec![GatewayError::Exchange("a".into())]);
        assert_eq!(err, GatewayError::Exchange("a".into()));
    }
}
