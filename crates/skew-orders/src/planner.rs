//! Incremental order planner.
//!
//! Diffs live orders against grid-aligned targets instead of cancelling
//! everything each cycle. Orders are keyed by `(PriceTick, side, reduce_only)`:
//! - a live order at a target's key with a matching amount is kept
//! - duplicates at a key and every other live order are cancelled
//! - targets with no surviving live order are placed
//!
//! Execution runs all operations concurrently and tolerates individual
//! failures; a batch succeeds when at least 80% of its operations do.

use std::collections::HashMap;

use futures_util::future::{join, join_all};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use skew_core::{Order, OrderId, OrderRequest, OrderSide, Price, PriceTick, Size};

use crate::error::{EngineError, EngineResult, GatewayError};
use crate::gateway::ExchangeGateway;

/// Amounts closer than this are considered equal.
const AMOUNT_EPSILON: Decimal = dec!(0.00000001);

/// Minimum share of successful operations for a batch to count as done.
const SUCCESS_THRESHOLD: f64 = 0.8;

type OrderKey = (PriceTick, OrderSide, bool);

/// One order the planner should leave resting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridTarget {
    pub side: OrderSide,
    pub reduce_only: bool,
    pub price: Price,
    pub amount: Size,
}

/// Operations needed to move live orders onto the targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPlan {
    pub orders_to_cancel: Vec<OrderId>,
    pub orders_to_place: Vec<OrderRequest>,
    /// Live orders left untouched.
    pub kept: usize,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.orders_to_cancel.is_empty() && self.orders_to_place.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.orders_to_cancel.len() + self.orders_to_place.len()
    }
}

/// Planner counters. Observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerStats {
    pub total_updates: u64,
    /// Cycles that produced at least one operation.
    pub action_updates: u64,
    /// Operations avoided compared to cancelling and re-placing everything.
    pub operations_saved: u64,
}

/// Result of executing a `DiffPlan`.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub cancelled: Vec<OrderId>,
    pub placed: Vec<Order>,
    pub failures: Vec<GatewayError>,
}

impl ExecutionReport {
    pub fn total(&self) -> usize {
        self.cancelled.len() + self.placed.len() + self.failures.len()
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (total - self.failures.len()) as f64 / total as f64
    }

    /// Empty plans succeed trivially.
    pub fn is_success(&self) -> bool {
        self.success_rate() >= SUCCESS_THRESHOLD
    }
}

/// Grid-aligned order diffing for one instrument.
#[derive(Debug)]
pub struct IncrementalOrderPlanner {
    symbol: String,
    tick_size: Price,
    grid_interval: Price,
    stats: PlannerStats,
}

impl IncrementalOrderPlanner {
    /// `grid_interval` defaults to the tick size.
    pub fn new(
        symbol: impl Into<String>,
        tick_size: Price,
        grid_interval: Option<Price>,
    ) -> EngineResult<Self> {
        if !tick_size.is_positive() {
            return Err(EngineError::Validation(format!(
                "tick size must be positive, got {tick_size}"
            )));
        }
        let grid_interval = grid_interval.unwrap_or(tick_size);
        if !grid_interval.is_positive() {
            return Err(EngineError::Validation(format!(
                "grid interval must be positive, got {grid_interval}"
            )));
        }
        Ok(Self {
            symbol: symbol.into(),
            tick_size,
            grid_interval,
            stats: PlannerStats::default(),
        })
    }

    pub fn grid_interval(&self) -> Price {
        self.grid_interval
    }

    /// Snap a target price onto the grid: bids round down, asks round up.
    pub fn align_to_grid(&self, side: OrderSide, price: Price) -> Price {
        match side {
            OrderSide::Buy => price
                .floor_to_tick(self.grid_interval)
                .floor_to_tick(self.tick_size),
            OrderSide::Sell => price
                .ceil_to_tick(self.grid_interval)
                .ceil_to_tick(self.tick_size),
        }
    }

    pub fn price_tick(&self, price: Price) -> EngineResult<PriceTick> {
        Ok(PriceTick::from_price(price, self.tick_size)?)
    }

    /// Build the cancel/place diff for `targets`.
    pub fn plan(&mut self, live: &[Order], targets: &[GridTarget]) -> EngineResult<DiffPlan> {
        let mut by_key: HashMap<OrderKey, Vec<&Order>> = HashMap::new();
        let mut orders_to_cancel = Vec::new();
        for order in live.iter().filter(|o| o.is_open()) {
            match self.price_tick(order.price) {
                Ok(tick) => by_key
                    .entry((tick, order.side, order.reduce_only))
                    .or_default()
                    .push(order),
                Err(_) => orders_to_cancel.push(order.id.clone()),
            }
        }

        let mut orders_to_place = Vec::new();
        let mut kept = 0;
        for target in targets {
            let price = self.align_to_grid(target.side, target.price);
            let key = (self.price_tick(price)?, target.side, target.reduce_only);
            let survivor = by_key.get_mut(&key).and_then(|orders| {
                let index = orders.iter().position(|o| {
                    (o.amount.inner() - target.amount.inner()).abs() <= AMOUNT_EPSILON
                })?;
                Some(orders.swap_remove(index))
            });
            match survivor {
                Some(_) => kept += 1,
                None => orders_to_place.push(OrderRequest {
                    symbol: self.symbol.clone(),
                    side: target.side,
                    price,
                    amount: target.amount,
                    reduce_only: target.reduce_only,
                }),
            }
        }

        orders_to_cancel.extend(by_key.into_values().flatten().map(|o| o.id.clone()));

        let plan = DiffPlan {
            orders_to_cancel,
            orders_to_place,
            kept,
        };
        self.record(live.len() + targets.len(), &plan);

        debug!(
            symbol = %self.symbol,
            cancel = plan.orders_to_cancel.len(),
            place = plan.orders_to_place.len(),
            kept = plan.kept,
            "Incremental plan built"
        );
        Ok(plan)
    }

    fn record(&mut self, naive: usize, plan: &DiffPlan) {
        let ops = plan.operation_count();
        self.stats.total_updates += 1;
        if ops > 0 {
            self.stats.action_updates += 1;
        }
        self.stats.operations_saved += naive.saturating_sub(ops) as u64;
    }

    /// Run every cancel and placement of `plan` concurrently.
    pub async fn execute(&self, gateway: &dyn ExchangeGateway, plan: &DiffPlan) -> ExecutionReport {
        let symbol = self.symbol.as_str();
        let cancels = join_all(plan.orders_to_cancel.iter().map(|id| async move {
            (id.clone(), gateway.cancel_order(id, symbol).await)
        }));
        let places = join_all(
            plan.orders_to_place
                .iter()
                .cloned()
                .map(|request| gateway.create_order(request)),
        );
        let (cancel_results, place_results) = join(cancels, places).await;

        let mut report = ExecutionReport::default();
        for (id, result) in cancel_results {
            match result {
                Ok(()) => report.cancelled.push(id),
                Err(e) => {
                    warn!(symbol = %self.symbol, order_id = %id, error = %e, "Cancel failed");
                    report.failures.push(e);
                }
            }
        }
        for result in place_results {
            match result {
                Ok(order) => report.placed.push(order),
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "Placement failed");
                    report.failures.push(e);
                }
            }
        }
        report
    }

    pub fn stats(&self) -> PlannerStats {
        self.stats
    }
}
