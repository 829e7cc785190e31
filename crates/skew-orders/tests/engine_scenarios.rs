//! End-to-end engine scenarios against the simulated gateway.
//!
//! All tests run on paused tokio time, so cool-downs, poll intervals and
//! recovery delays elapse instantly and deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use skew_core::{MetricsSink, OrderSide, Price, Size};
use skew_orders::{
    EngineConfig, EngineHandle, ExchangeGateway, InstrumentEngine, InstrumentSettings,
    SimulatedGateway, SimulatedMarket,
};
use skew_quote::{QuoteConfig, VolatilityConfig};

const SYMBOL: &str = "BTC/USDT";

/// Counts fills per detection channel and recovery transitions.
#[derive(Default)]
struct RecordingSink {
    fills: Mutex<HashMap<String, usize>>,
    recoveries: Mutex<Vec<bool>>,
}

impl RecordingSink {
    fn fills(&self, channel: &str) -> usize {
        self.fills.lock().get(channel).copied().unwrap_or(0)
    }

    fn total_fills(&self) -> usize {
        self.fills.lock().values().sum()
    }
}

impl MetricsSink for RecordingSink {
    fn reconcile(&self, _symbol: &str, _mode: &str, _outcome: &str) {}

    fn orders_churned(&self, _symbol: &str, _placed: usize, _cancelled: usize) {}

    fn planner_stats(&self, _symbol: &str, _total: u64, _action: u64, _saved: u64) {}

    fn fill_detected(&self, _symbol: &str, channel: &str) {
        *self.fills.lock().entry(channel.to_string()).or_default() += 1;
    }

    fn recovery_state(&self, _symbol: &str, in_recovery: bool) {
        self.recoveries.lock().push(in_recovery);
    }

    fn spreads(&self, _symbol: &str, _buy_spread: f64, _sell_spread: f64) {}
}

fn settings(quote: QuoteConfig) -> InstrumentSettings {
    InstrumentSettings {
        symbol: SYMBOL.to_string(),
        leverage: 1,
        engine: EngineConfig::default(),
        quote,
        volatility: VolatilityConfig::default(),
    }
}

async fn start(
    gateway: Arc<SimulatedGateway>,
    settings: InstrumentSettings,
) -> (EngineHandle, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = InstrumentEngine::build(settings, gateway, sink.clone(), CancellationToken::new())
        .await
        .expect("engine builds");
    (engine.spawn(), sink)
}

fn gateway() -> Arc<SimulatedGateway> {
    Arc::new(SimulatedGateway::new(SimulatedMarket::new(
        SYMBOL,
        dec!(100),
        dec!(1000),
    )))
}

async fn wait_for_created(gateway: &SimulatedGateway, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.created_orders().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("orders created in time");
}

#[tokio::test(start_paused = true)]
async fn test_startup_places_quote_and_shutdown_cancels() {
    let gateway = gateway();
    let (handle, _sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;

    wait_for_created(&gateway, 2).await;
    let mut open = gateway.open_orders();
    open.sort_by_key(|o| o.price);
    assert_eq!(open.len(), 2);
    // Flat inventory quotes at the minimum spread (0.0008).
    assert_eq!(open[0].side, OrderSide::Buy);
    assert_eq!(open[0].price, Price::new(dec!(99.92)));
    assert_eq!(open[1].side, OrderSide::Sell);
    assert_eq!(open[1].price, Price::new(dec!(100.08)));
    // 5% of 1000 equity at 100.
    assert!(open.iter().all(|o| o.amount == Size::new(dec!(0.5))));
    assert!(open.iter().all(|o| !o.reduce_only));

    handle.shutdown(Duration::from_secs(5)).await;
    assert!(gateway.open_orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_matching_orders_are_left_alone() {
    let gateway = gateway();
    gateway.seed_order(OrderSide::Buy, Price::new(dec!(99.5)), Size::new(dec!(0.5)), false);
    gateway.seed_order(OrderSide::Sell, Price::new(dec!(100.5)), Size::new(dec!(0.5)), false);

    let quote = QuoteConfig {
        min_spread: dec!(0.005),
        base_spread: dec!(0.01),
        max_spread: dec!(0.02),
        ..Default::default()
    };
    let (handle, sink) = start(gateway.clone(), settings(quote)).await;

    // Covers the startup pass, two fill polls and one health check.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(gateway.created_orders().is_empty());
    assert_eq!(gateway.cancel_calls(), 0);
    assert_eq!(gateway.open_orders().len(), 2);
    assert_eq!(sink.total_fills(), 0);
    assert_eq!(handle.watcher().watched(), 2);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_fill_detected_once_by_poll() {
    let gateway = gateway();
    gateway.set_silent_fills(true);
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    let buy = gateway
        .open_orders()
        .into_iter()
        .find(|o| o.side == OrderSide::Buy)
        .expect("buy order resting");
    gateway.fill_order(&buy.id).expect("buy order filled");

    // Nothing is reported before the first poll.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sink.total_fills(), 0);
    assert_eq!(gateway.created_orders().len(), 2);

    // Poll at 5s detects it; re-quote follows the cool-down.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(sink.fills("poll"), 1);
    assert_eq!(sink.fills("stream"), 0);

    let open = gateway.open_orders();
    assert_eq!(open.len(), 3);
    assert_eq!(gateway.created_orders().len(), 5);
    assert!(open
        .iter()
        .any(|o| o.side == OrderSide::Sell && o.reduce_only));

    // Later polls do not report the same fill again.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(sink.total_fills(), 1);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_fill_settled_before_requote() {
    let gateway = gateway();
    gateway.set_silent_fills(true);
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    // The move crosses the 99.92 bid; only the book and positions streams see it.
    gateway.set_price(Price::new(dec!(99.5)));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The re-quote found the fill before cancelling, well ahead of the 5s poll.
    assert_eq!(sink.fills("poll"), 1);
    assert_eq!(
        handle.state().snapshot().last_fill_price,
        Some(Price::new(dec!(99.92)))
    );
    let open = gateway.open_orders();
    assert_eq!(open.len(), 3);
    assert!(open
        .iter()
        .any(|o| o.side == OrderSide::Sell && o.reduce_only));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(sink.total_fills(), 1);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_streamed_fill_requotes_with_close_order() {
    let gateway = gateway();
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    let buy = gateway
        .open_orders()
        .into_iter()
        .find(|o| o.side == OrderSide::Buy)
        .expect("buy order resting");
    gateway.fill_order(&buy.id).expect("buy order filled");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.fills("stream"), 1);
    let open = gateway.open_orders();
    assert_eq!(open.len(), 3);
    assert!(open
        .iter()
        .any(|o| o.side == OrderSide::Sell && o.reduce_only));

    // The stream already consumed the fill; polling finds nothing extra.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.total_fills(), 1);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_network_outage_enters_recovery_once() {
    let gateway = gateway();
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    gateway.set_offline(true);
    // A small move wakes the streams, which then hit the outage.
    gateway.set_price(Price::new(dec!(100.02)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let recovery = handle.recovery();
    assert!(recovery.is_recovering());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(recovery.is_recovering());
    assert!(recovery.attempts() >= 1);

    gateway.set_offline(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!recovery.is_recovering());
    assert_eq!(*sink.recoveries.lock(), vec![true, false]);

    // Orders survived the outage untouched.
    assert_eq!(gateway.open_orders().len(), 2);
    assert_eq!(gateway.created_orders().len(), 2);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_quiet_outage_detected_by_fill_check() {
    let gateway = gateway();
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    // No market move, so every stream stays parked; only polling notices.
    gateway.set_offline(true);
    tokio::time::sleep(Duration::from_secs(6)).await;
    let recovery = handle.recovery();
    assert!(recovery.is_recovering());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(recovery.attempts() >= 1);

    gateway.set_offline(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!recovery.is_recovering());
    assert_eq!(*sink.recoveries.lock(), vec![true, false]);
    assert_eq!(gateway.open_orders().len(), 2);
    assert_eq!(gateway.created_orders().len(), 2);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_external_cancel_restores_quote() {
    let gateway = gateway();
    let (handle, sink) = start(gateway.clone(), settings(QuoteConfig::default())).await;
    wait_for_created(&gateway, 2).await;

    let sell = gateway
        .open_orders()
        .into_iter()
        .find(|o| o.side == OrderSide::Sell)
        .expect("sell order resting");
    gateway
        .cancel_order(&sell.id, SYMBOL)
        .await
        .expect("sell order cancelled");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let open = gateway.open_orders();
    assert_eq!(open.len(), 2);
    assert!(open.iter().any(|o| o.side == OrderSide::Sell));
    assert_eq!(gateway.created_orders().len(), 4);
    assert_eq!(sink.total_fills(), 0);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_incremental_mode_keeps_undrifted_order() {
    let gateway = gateway();
    let mut settings = settings(QuoteConfig::default());
    settings.engine.incremental_enabled = true;
    settings.engine.use_transaction_price_basis = false;
    let (handle, _sink) = start(gateway.clone(), settings).await;
    wait_for_created(&gateway, 2).await;

    let open = gateway.open_orders();
    let buy = open
        .iter()
        .find(|o| o.side == OrderSide::Buy)
        .expect("buy order resting");
    let sell = open
        .iter()
        .find(|o| o.side == OrderSide::Sell)
        .expect("sell order resting");

    // Long inventory widens the bid only; the ask keeps its tick.
    gateway.fill_order(&buy.id).expect("buy order filled");
    tokio::time::sleep(Duration::from_secs(1)).await;

    let open = gateway.open_orders();
    assert_eq!(open.len(), 3);
    assert!(open.iter().any(|o| o.id == sell.id));
    assert!(open
        .iter()
        .any(|o| o.side == OrderSide::Sell && o.reduce_only && o.price == sell.price));
    assert!(open
        .iter()
        .any(|o| o.side == OrderSide::Buy && o.price < buy.price));
    assert_eq!(gateway.cancel_calls(), 0);
    assert_eq!(gateway.created_orders().len(), 4);

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let gateway = gateway();
    let mut settings = settings(QuoteConfig::default());
    settings.engine.order_amount_ratio = dec!(0);

    let result = InstrumentEngine::build(
        settings,
        gateway,
        Arc::new(skew_core::NoopSink),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}
