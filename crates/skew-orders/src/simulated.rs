//! In-memory exchange gateway.
//!
//! Keeps a single-instrument order book of resting limit orders and fills
//! them when the simulated price crosses. Used for paper runs and as the
//! gateway behind the integration tests:
//! - `set_price` moves the market and fills crossing orders
//! - `set_offline` makes every call fail with a network error
//! - `fail_next_create` scripts individual order rejections
//! - `set_silent_fills` suppresses fill events on the order stream

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};

use skew_core::{
    Balance, BookTop, Candle, InstrumentSpec, Order, OrderId, OrderRequest, OrderSide,
    OrderStatus, Position, PositionSide, Price, Size, Ticker,
};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{BoxFuture, ExchangeGateway};

const CANDLE_MS: i64 = 60_000;
const MAX_CANDLE_HISTORY: usize = 500;

/// Starting conditions for a simulated market.
#[derive(Debug, Clone)]
pub struct SimulatedMarket {
    pub instrument: InstrumentSpec,
    pub initial_price: Price,
    /// Free balance in the settlement coin.
    pub balance: Decimal,
}

impl SimulatedMarket {
    pub fn new(symbol: &str, initial_price: Decimal, balance: Decimal) -> Self {
        Self {
            instrument: InstrumentSpec {
                symbol: symbol.to_string(),
                tick_size: Price::new(dec!(0.01)),
                min_amount: Size::new(dec!(0.001)),
                amount_step: Size::new(dec!(0.001)),
            },
            initial_price: Price::new(initial_price),
            balance,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SideBook {
    size: Decimal,
    margin: Decimal,
}

#[derive(Debug)]
struct SimState {
    last_price: Price,
    free: Decimal,
    long: SideBook,
    short: SideBook,
    leverage: Decimal,
    open: Vec<Order>,
    history: HashMap<OrderId, Order>,
    create_failures: VecDeque<GatewayError>,
    created: Vec<OrderRequest>,
    cancel_calls: usize,
    candle: Option<Candle>,
    candles: VecDeque<Candle>,
}

impl SimState {
    fn balance(&self) -> Balance {
        Balance {
            free: self.free,
            total: self.free + self.long.margin + self.short.margin,
        }
    }

    fn positions(&self, symbol: &str) -> Vec<Position> {
        [(PositionSide::Long, self.long), (PositionSide::Short, self.short)]
            .into_iter()
            .filter(|(_, book)| book.size > Decimal::ZERO)
            .map(|(side, book)| Position {
                symbol: symbol.to_string(),
                side,
                size: Size::new(book.size),
                margin: book.margin,
            })
            .collect()
    }

    fn book(&self, tick: Price) -> BookTop {
        BookTop {
            best_bid: Some(self.last_price - tick),
            best_ask: Some(self.last_price + tick),
        }
    }

    /// Apply a fill to positions and balance.
    fn settle(&mut self, order: &Order) {
        let amount = order.amount.inner();
        let notional_margin = amount * order.price.inner() / self.leverage;
        let (opening, closing) = match order.side {
            OrderSide::Buy => (&mut self.long, &mut self.short),
            OrderSide::Sell => (&mut self.short, &mut self.long),
        };
        if order.reduce_only {
            if closing.size <= Decimal::ZERO {
                return;
            }
            let reduced = amount.min(closing.size);
            let released = closing.margin * reduced / closing.size;
            closing.size -= reduced;
            closing.margin -= released;
            self.free += released;
        } else {
            opening.size += amount;
            opening.margin += notional_margin;
            self.free -= notional_margin;
        }
    }

    fn fill(&mut self, index: usize) -> Order {
        let mut order = self.open.remove(index);
        order.status = OrderStatus::Filled;
        order.filled = order.amount;
        self.settle(&order);
        self.history.insert(order.id.clone(), order.clone());
        order
    }

    fn record_price(&mut self, price: Price) -> Candle {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let bucket = now_ms - now_ms.rem_euclid(CANDLE_MS);
        let p = price.inner();
        let candle = match self.candle.take() {
            Some(mut c) if c.timestamp_ms == bucket => {
                c.high = c.high.max(p);
                c.low = c.low.min(p);
                c.close = p;
                c
            }
            previous => {
                if let Some(done) = previous {
                    self.candles.push_back(done);
                    while self.candles.len() > MAX_CANDLE_HISTORY {
                        self.candles.pop_front();
                    }
                }
                Candle {
                    timestamp_ms: bucket,
                    open: p,
                    high: p,
                    low: p,
                    close: p,
                    volume: Decimal::ZERO,
                }
            }
        };
        self.candle = Some(candle);
        candle
    }
}

/// Single-instrument in-memory gateway.
pub struct SimulatedGateway {
    instrument: InstrumentSpec,
    state: Mutex<SimState>,
    offline: AtomicBool,
    silent_fills: AtomicBool,
    order_details_unavailable: AtomicBool,
    order_tx: mpsc::UnboundedSender<Vec<Order>>,
    order_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Order>>>,
    candle_tx: mpsc::UnboundedSender<Candle>,
    candle_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Candle>>,
    book_tx: watch::Sender<BookTop>,
    book_rx: tokio::sync::Mutex<watch::Receiver<BookTop>>,
    balance_tx: watch::Sender<Balance>,
    balance_rx: tokio::sync::Mutex<watch::Receiver<Balance>>,
    positions_tx: watch::Sender<Vec<Position>>,
    positions_rx: tokio::sync::Mutex<watch::Receiver<Vec<Position>>>,
}

impl SimulatedGateway {
    pub fn new(market: SimulatedMarket) -> Self {
        let state = SimState {
            last_price: market.initial_price,
            free: market.balance,
            long: SideBook::default(),
            short: SideBook::default(),
            leverage: Decimal::ONE,
            open: Vec::new(),
            history: HashMap::new(),
            create_failures: VecDeque::new(),
            created: Vec::new(),
            cancel_calls: 0,
            candle: None,
            candles: VecDeque::new(),
        };
        let (order_tx, order_rx) = mpsc::unbounded_channel();
        let (candle_tx, candle_rx) = mpsc::unbounded_channel();
        let (book_tx, book_rx) = watch::channel(state.book(market.instrument.tick_size));
        let (balance_tx, balance_rx) = watch::channel(state.balance());
        let (positions_tx, positions_rx) = watch::channel(Vec::new());

        Self {
            instrument: market.instrument,
            state: Mutex::new(state),
            offline: AtomicBool::new(false),
            silent_fills: AtomicBool::new(false),
            order_details_unavailable: AtomicBool::new(false),
            order_tx,
            order_rx: tokio::sync::Mutex::new(order_rx),
            candle_tx,
            candle_rx: tokio::sync::Mutex::new(candle_rx),
            book_tx,
            book_rx: tokio::sync::Mutex::new(book_rx),
            balance_tx,
            balance_rx: tokio::sync::Mutex::new(balance_rx),
            positions_tx,
            positions_rx: tokio::sync::Mutex::new(positions_rx),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    /// Move the market, filling every order the new price crosses.
    pub fn set_price(&self, price: Price) -> Vec<Order> {
        let (fills, candle, book) = {
            let mut state = self.state.lock();
            state.last_price = price;
            let candle = state.record_price(price);
            let mut fills = Vec::new();
            let mut i = 0;
            while i < state.open.len() {
                let order = &state.open[i];
                let crossed = match order.side {
                    OrderSide::Buy => price <= order.price,
                    OrderSide::Sell => price >= order.price,
                };
                if crossed {
                    fills.push(state.fill(i));
                } else {
                    i += 1;
                }
            }
            (fills, candle, state.book(self.instrument.tick_size))
        };

        self.book_tx.send_replace(book);
        let _ = self.candle_tx.send(candle);
        if !fills.is_empty() {
            self.publish_fills(fills.clone());
        }
        fills
    }

    /// Fill one resting order at its limit price.
    pub fn fill_order(&self, id: &OrderId) -> Option<Order> {
        let filled = {
            let mut state = self.state.lock();
            let index = state.open.iter().position(|o| &o.id == id)?;
            state.fill(index)
        };
        self.publish_fills(vec![filled.clone()]);
        Some(filled)
    }

    fn publish_fills(&self, fills: Vec<Order>) {
        let (balance, positions) = {
            let state = self.state.lock();
            (state.balance(), state.positions(&self.instrument.symbol))
        };
        if !self.silent_fills.load(Ordering::SeqCst) {
            let _ = self.order_tx.send(fills);
        }
        self.positions_tx.send_replace(positions);
        self.balance_tx.send_replace(balance);
    }

    /// Add a resting order directly, bypassing `create_order` bookkeeping.
    pub fn seed_order(
        &self,
        side: OrderSide,
        price: Price,
        amount: Size,
        reduce_only: bool,
    ) -> Order {
        let order = Order {
            id: OrderId::generate("seed"),
            symbol: self.instrument.symbol.clone(),
            side,
            price,
            amount,
            filled: Size::ZERO,
            reduce_only,
            status: OrderStatus::Open,
        };
        let mut state = self.state.lock();
        state.open.push(order.clone());
        state.history.insert(order.id.clone(), order.clone());
        order
    }

    /// Open a position directly, as if filled before the engine started.
    pub fn seed_position(&self, side: PositionSide, size: Decimal, margin: Decimal) {
        let mut state = self.state.lock();
        let book = match side {
            PositionSide::Long => &mut state.long,
            PositionSide::Short => &mut state.short,
        };
        book.size += size;
        book.margin += margin;
        state.free -= margin;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_silent_fills(&self, silent: bool) {
        self.silent_fills.store(silent, Ordering::SeqCst);
    }

    /// Make `fetch_order` fail, as exchanges do for pruned orders.
    pub fn set_order_details_unavailable(&self, unavailable: bool) {
        self.order_details_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject the next `create_order` call with `error`.
    pub fn fail_next_create(&self, error: GatewayError) {
        self.state.lock().create_failures.push_back(error);
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state.lock().open.clone()
    }

    /// Every request accepted by `create_order`.
    pub fn created_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().created.clone()
    }

    /// Number of `cancel_order` / `cancel_all_orders` calls that reached the book.
    pub fn cancel_calls(&self) -> usize {
        self.state.lock().cancel_calls
    }

    pub fn last_price(&self) -> Price {
        self.state.lock().last_price
    }

    fn ensure_online(&self) -> GatewayResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Network("simulated outage".to_string()));
        }
        Ok(())
    }

    fn ensure_symbol(&self, symbol: &str) -> GatewayResult<()> {
        if symbol != self.instrument.symbol {
            return Err(GatewayError::Exchange(format!("unknown symbol {symbol}")));
        }
        Ok(())
    }

    fn cancel_open(&self, filter: impl Fn(&Order) -> bool) -> Vec<Order> {
        let mut state = self.state.lock();
        state.cancel_calls += 1;
        let (cancelled, kept): (Vec<Order>, Vec<Order>) =
            std::mem::take(&mut state.open).into_iter().partition(|o| filter(o));
        state.open = kept;
        cancelled
            .into_iter()
            .map(|mut o| {
                o.status = OrderStatus::Canceled;
                state.history.insert(o.id.clone(), o.clone());
                o
            })
            .collect()
    }
}

impl ExchangeGateway for SimulatedGateway {
    fn load_instrument<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<InstrumentSpec>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            Ok(self.instrument.clone())
        })
    }

    fn fetch_balance<'a>(&'a self, _coin: &'a str) -> BoxFuture<'a, GatewayResult<Balance>> {
        Box::pin(async move {
            self.ensure_online()?;
            Ok(self.state.lock().balance())
        })
    }

    fn fetch_positions<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Position>>> {
        Box::pin(async move {
            self.ensure_online()?;
            Ok(self.state.lock().positions(symbol))
        })
    }

    fn fetch_open_orders<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Order>>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            Ok(self.state.lock().open.clone())
        })
    }

    fn fetch_order<'a>(
        &'a self,
        id: &'a OrderId,
        _symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Order>> {
        Box::pin(async move {
            self.ensure_online()?;
            if self.order_details_unavailable.load(Ordering::SeqCst) {
                return Err(GatewayError::Exchange(format!("order {id} not found")));
            }
            self.state
                .lock()
                .history
                .get(id)
                .cloned()
                .ok_or_else(|| GatewayError::Exchange(format!("order {id} not found")))
        })
    }

    fn fetch_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<Ticker>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            Ok(Ticker {
                last: self.state.lock().last_price,
            })
        })
    }

    fn fetch_ohlcv<'a>(
        &'a self,
        symbol: &'a str,
        _timeframe: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, GatewayResult<Vec<Candle>>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            let state = self.state.lock();
            let mut candles: Vec<Candle> = state.candles.iter().copied().collect();
            candles.extend(state.candle);
            let skip = candles.len().saturating_sub(limit);
            Ok(candles.split_off(skip))
        })
    }

    fn watch_order_book<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, GatewayResult<BookTop>> {
        Box::pin(async move {
            self.ensure_online()?;
            let mut rx = self.book_rx.lock().await;
            rx.changed()
                .await
                .map_err(|_| GatewayError::Other("book feed closed".to_string()))?;
            let book = *rx.borrow_and_update();
            Ok(book)
        })
    }

    fn watch_balance<'a>(&'a self, _coin: &'a str) -> BoxFuture<'a, GatewayResult<Balance>> {
        Box::pin(async move {
            self.ensure_online()?;
            let mut rx = self.balance_rx.lock().await;
            rx.changed()
                .await
                .map_err(|_| GatewayError::Other("balance feed closed".to_string()))?;
            let balance = *rx.borrow_and_update();
            Ok(balance)
        })
    }

    fn watch_positions<'a>(
        &'a self,
        _symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Position>>> {
        Box::pin(async move {
            self.ensure_online()?;
            let mut rx = self.positions_rx.lock().await;
            rx.changed()
                .await
                .map_err(|_| GatewayError::Other("position feed closed".to_string()))?;
            let positions = rx.borrow_and_update().clone();
            Ok(positions)
        })
    }

    fn watch_orders<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, GatewayResult<Vec<Order>>> {
        Box::pin(async move {
            self.ensure_online()?;
            let mut rx = self.order_rx.lock().await;
            let mut batch = rx
                .recv()
                .await
                .ok_or_else(|| GatewayError::Other("order feed closed".to_string()))?;
            while let Ok(more) = rx.try_recv() {
                batch.extend(more);
            }
            Ok(batch)
        })
    }

    fn watch_ohlcv<'a>(
        &'a self,
        _symbol: &'a str,
        _timeframe: &'a str,
    ) -> BoxFuture<'a, GatewayResult<Vec<Candle>>> {
        Box::pin(async move {
            self.ensure_online()?;
            let mut rx = self.candle_rx.lock().await;
            let first = rx
                .recv()
                .await
                .ok_or_else(|| GatewayError::Other("candle feed closed".to_string()))?;
            let mut candles = vec![first];
            while let Ok(more) = rx.try_recv() {
                candles.push(more);
            }
            Ok(candles)
        })
    }

    fn create_order(&self, request: OrderRequest) -> BoxFuture<'_, GatewayResult<Order>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(&request.symbol)?;
            let order = {
                let mut state = self.state.lock();
                if let Some(error) = state.create_failures.pop_front() {
                    return Err(error);
                }
                if request.amount < self.instrument.min_amount {
                    return Err(GatewayError::Exchange(format!(
                        "amount {} below minimum {}",
                        request.amount, self.instrument.min_amount
                    )));
                }
                if !request.price.is_positive() {
                    return Err(GatewayError::Exchange(format!(
                        "invalid price {}",
                        request.price
                    )));
                }
                let order = Order {
                    id: OrderId::generate("sim"),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    price: request.price,
                    amount: request.amount,
                    filled: Size::ZERO,
                    reduce_only: request.reduce_only,
                    status: OrderStatus::Open,
                };
                state.open.push(order.clone());
                state.history.insert(order.id.clone(), order.clone());
                state.created.push(request);
                order
            };
            let _ = self.order_tx.send(vec![order.clone()]);
            Ok(order)
        })
    }

    fn cancel_order<'a>(
        &'a self,
        id: &'a OrderId,
        symbol: &'a str,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            let cancelled = self.cancel_open(|o| &o.id == id);
            if cancelled.is_empty() {
                return Err(GatewayError::Exchange(format!("order {id} is not open")));
            }
            let _ = self.order_tx.send(cancelled);
            Ok(())
        })
    }

    fn cancel_all_orders<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            let cancelled = self.cancel_open(|_| true);
            if !cancelled.is_empty() {
                let _ = self.order_tx.send(cancelled);
            }
            Ok(())
        })
    }

    fn set_hedge_mode<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)
        })
    }

    fn set_leverage<'a>(
        &'a self,
        symbol: &'a str,
        leverage: u32,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_online()?;
            self.ensure_symbol(symbol)?;
            if leverage == 0 {
                return Err(GatewayError::Exchange("leverage must be positive".to_string()));
            }
            self.state.lock().leverage = Decimal::from(leverage);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn gateway() -> SimulatedGateway {
        SimulatedGateway::new(SimulatedMarket::new("BTC/USDT", dec!(100), dec!(1000)))
    }

    fn request(side: OrderSide, price: Decimal, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side,
            price: Price::new(price),
            amount: Size::new(dec!(1)),
            reduce_only,
        }
    }

    #[tokio::test]
    async fn test_create_and_fill_on_price_cross() {
        let gw = gateway();
        let order = gw
            .create_order(request(OrderSide::Buy, dec!(99), false))
            .await
            .unwrap();
        assert_eq!(gw.open_orders().len(), 1);

        assert!(gw.set_price(Price::new(dec!(99.5))).is_empty());
        let fills = gw.set_price(Price::new(dec!(98.9)));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].id, order.id);
        assert_eq!(fills[0].status, OrderStatus::Filled);

        let positions = gw.fetch_positions("BTC/USDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].margin, dec!(99));

        let balance = gw.fetch_balance("USDT").await.unwrap();
        assert_eq!(balance.free, dec!(901));
        assert_eq!(balance.total, dec!(1000));
    }

    #[tokio::test]
    async fn test_reduce_only_releases_margin() {
        let gw = gateway();
        gw.seed_position(PositionSide::Long, dec!(2), dec!(200));
        let order = gw
            .create_order(request(OrderSide::Sell, dec!(101), true))
            .await
            .unwrap();
        gw.fill_order(&order.id).unwrap();

        let positions = gw.fetch_positions("BTC/USDT").await.unwrap();
        assert_eq!(positions[0].size.inner(), dec!(1));
        assert_eq!(positions[0].margin, dec!(100));
    }

    #[test]
    fn test_offline_returns_network_error() {
        let gw = gateway();
        gw.set_offline(true);
        let err = assert_err!(block_on(gw.fetch_open_orders("BTC/USDT")));
        assert!(err.is_network());

        gw.set_offline(false);
        assert_ok!(block_on(gw.fetch_open_orders("BTC/USDT")));
    }

    #[test]
    fn test_scripted_create_failure() {
        let gw = gateway();
        gw.fail_next_create(GatewayError::Exchange("rejected".to_string()));
        let err = assert_err!(block_on(
            gw.create_order(request(OrderSide::Buy, dec!(99), false))
        ));
        assert_eq!(err.kind(), "exchange");
        assert_ok!(block_on(
            gw.create_order(request(OrderSide::Buy, dec!(99), false))
        ));
        assert_eq!(gw.created_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_publishes_events() {
        let gw = gateway();
        gw.create_order(request(OrderSide::Buy, dec!(99), false))
            .await
            .unwrap();
        gw.create_order(request(OrderSide::Sell, dec!(101), false))
            .await
            .unwrap();
        gw.cancel_all_orders("BTC/USDT").await.unwrap();

        assert!(gw.open_orders().is_empty());
        let events = gw.watch_orders("BTC/USDT").await.unwrap();
        let cancelled = events
            .iter()
            .filter(|o| o.status == OrderStatus::Canceled)
            .count();
        assert_eq!(cancelled, 2);
    }

    #[tokio::test]
    async fn test_silent_fill_keeps_order_details() {
        let gw = gateway();
        gw.set_silent_fills(true);
        let order = gw
            .create_order(request(OrderSide::Sell, dec!(101), false))
            .await
            .unwrap();
        // Drain the creation event.
        gw.watch_orders("BTC/USDT").await.unwrap();
        gw.set_price(Price::new(dec!(102)));

        assert!(gw.open_orders().is_empty());
        let details = gw.fetch_order(&order.id, "BTC/USDT").await.unwrap();
        assert_eq!(details.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_min_amount_rejected() {
        let gw = gateway();
        let mut req = request(OrderSide::Buy, dec!(99), false);
        req.amount = Size::new(dec!(0.0001));
        let err = gw.create_order(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Exchange(_)));
    }
}
