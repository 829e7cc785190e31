//! Shared engine state.
//!
//! Each stream task writes one kind of update; readers take an immutable
//! `Arc<EngineSnapshot>` and never hold the lock across an await.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;

use skew_core::{
    AccountState, Balance, BookTop, NetPositionView, Order, OrderId, OrderStatus, Position, Price,
};

/// Point-in-time view of one instrument's account and market state.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub account: AccountState,
    pub positions: NetPositionView,
    pub open_orders: Vec<Order>,
    pub book: Option<BookTop>,
    pub last_price: Option<Price>,
    /// Price of the most recent fill seen on either fill channel.
    pub last_fill_price: Option<Price>,
    /// When the open order list last became empty.
    pub orders_empty_since: Option<Instant>,
    pub updated_at_ms: i64,
}

impl EngineSnapshot {
    /// Quote basis: last fill (if enabled), else book mid, else last trade.
    pub fn basis_price(&self, use_fill_price: bool) -> Option<Price> {
        if use_fill_price {
            if let Some(price) = self.last_fill_price.filter(Price::is_positive) {
                return Some(price);
            }
        }
        self.book
            .and_then(|b| b.mid())
            .filter(Price::is_positive)
            .or(self.last_price.filter(Price::is_positive))
    }
}

/// Single-writer-per-kind state store.
#[derive(Debug)]
pub struct StateStore {
    symbol: String,
    inner: RwLock<Arc<EngineSnapshot>>,
}

impl StateStore {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            inner: RwLock::new(Arc::new(EngineSnapshot {
                orders_empty_since: Some(Instant::now()),
                ..Default::default()
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.inner.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut EngineSnapshot)) {
        let mut guard = self.inner.write();
        let snapshot = Arc::make_mut(&mut guard);
        f(snapshot);
        snapshot.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn apply_balance(&self, balance: Balance) {
        self.update(|s| s.account = AccountState::from(balance));
    }

    pub fn apply_positions(&self, positions: &[Position]) {
        let view = NetPositionView::from_positions(&self.symbol, positions);
        self.update(|s| s.positions = view);
    }

    pub fn apply_book(&self, book: BookTop) {
        self.update(|s| s.book = Some(book));
    }

    pub fn apply_ticker(&self, last: Price) {
        self.update(|s| s.last_price = Some(last));
    }

    /// Replace the open order list with a fresh exchange snapshot.
    pub fn replace_open_orders(&self, orders: Vec<Order>) {
        self.update(|s| {
            s.open_orders = orders.into_iter().filter(Order::is_open).collect();
            track_empty(s);
        });
    }

    /// Merge order events: open orders are upserted, terminal ones removed.
    pub fn apply_order_updates(&self, updates: &[Order]) {
        self.update(|s| {
            for order in updates.iter().filter(|o| o.symbol == self.symbol) {
                s.open_orders.retain(|o| o.id != order.id);
                match order.status {
                    OrderStatus::Open => s.open_orders.push(order.clone()),
                    OrderStatus::Filled => s.last_fill_price = Some(order.price),
                    OrderStatus::Canceled => {}
                }
            }
            track_empty(s);
        });
    }

    /// Drop orders we cancelled ourselves.
    pub fn remove_orders(&self, ids: &[OrderId]) {
        if ids.is_empty() {
            return;
        }
        self.update(|s| {
            s.open_orders.retain(|o| !ids.contains(&o.id));
            track_empty(s);
        });
    }

    pub fn record_fill_price(&self, price: Price) {
        if price.is_positive() {
            self.update(|s| s.last_fill_price = Some(price));
        }
    }
}

fn track_empty(s: &mut EngineSnapshot) {
    match (s.open_orders.is_empty(), s.orders_empty_since) {
        (true, None) => s.orders_empty_since = Some(Instant::now()),
        (false, Some(_)) => s.orders_empty_since = None,
        _ => {}
    }
}
