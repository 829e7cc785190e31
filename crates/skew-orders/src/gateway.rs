//! Exchange gateway trait.
//!
//! Abstracts the exchange connectivity layer so the engine can be driven by:
//! - A live exchange adapter
//! - `SimulatedGateway` for paper runs and tests
//!
//! Methods return boxed futures so the trait stays dyn-compatible.
//! Streaming methods (`watch_*`) resolve with one update per call and are
//! re-invoked in a loop by the owning task.

use std::pin::Pin;
use std::sync::Arc;

use skew_core::{
    Balance, BookTop, Candle, InstrumentSpec, Order, OrderId, OrderRequest, Position, Ticker,
};

use crate::error::GatewayResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Capability set the engine consumes from an exchange.
pub trait ExchangeGateway: Send + Sync {
    /// Trading rules (tick size, minimum amount) for `symbol`.
    fn load_instrument<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<InstrumentSpec>>;

    fn fetch_balance<'a>(&'a self, coin: &'a str) -> BoxFuture<'a, GatewayResult<Balance>>;

    fn fetch_positions<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Position>>>;

    fn fetch_open_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<Vec<Order>>>;

    /// Details of a single order, open or not.
    fn fetch_order<'a>(
        &'a self,
        id: &'a OrderId,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Order>>;

    fn fetch_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<Ticker>>;

    fn fetch_ohlcv<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, GatewayResult<Vec<Candle>>>;

    fn watch_order_book<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<BookTop>>;

    fn watch_balance<'a>(&'a self, coin: &'a str) -> BoxFuture<'a, GatewayResult<Balance>>;

    fn watch_positions<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Position>>>;

    /// Next batch of order events for `symbol`.
    fn watch_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<Vec<Order>>>;

    fn watch_ohlcv<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Candle>>>;

    /// Submit a limit order.
    fn create_order(&self, request: OrderRequest) -> BoxFuture<'_, GatewayResult<Order>>;

    fn cancel_order<'a>(
        &'a self,
        id: &'a OrderId,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<()>>;

    fn cancel_all_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<()>>;

    /// Switch the account to hedge (dual-side) position mode.
    fn set_hedge_mode<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<()>>;

    fn set_leverage<'a>(
        &'a self,
        symbol: &'a str,
        leverage: u32,
    ) -> BoxFuture<'a, GatewayResult<()>>;
}

/// Arc wrapper for gateway trait objects.
pub type DynGateway = Arc<dyn ExchangeGateway>;
