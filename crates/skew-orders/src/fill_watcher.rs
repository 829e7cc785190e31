//! Fill detection over two channels.
//!
//! Order ids are registered when placed. A fill is detected either from a
//! pushed order event with `filled` status (stream channel), or by polling
//! open orders and treating registered ids that disappeared as filled
//! (poll channel). Removing the id from the registry is the dedup point:
//! whichever channel removes it first reports the fill, the other sees
//! nothing.
//!
//! Orders we cancel ourselves move to a separate cancelling set until the
//! exchange confirms the cancel. A fill that races our cancel is still
//! reported; the cancel itself is not. A registered order cancelled by
//! anyone else is reported to the sink as an external cancel.
//!
//! Detection clears the whole watch and hands a `FillBatch` to the
//! `FillSink`. If the sink refuses the batch it stays pending and is
//! retried on the next check after a short pause.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use skew_core::{MetricsSink, NoopSink, Order, OrderId, OrderSide, OrderStatus, Price, Size};

use crate::error::EngineResult;
use crate::gateway::{BoxFuture, ExchangeGateway};

/// Receiver of detected fills.
pub trait FillSink: Send + Sync {
    fn notify(&self, batch: FillBatch) -> BoxFuture<'_, EngineResult<()>>;

    /// Watched orders were cancelled outside this engine.
    ///
    /// Must not block: it is also called from inside a reconciliation pass.
    fn external_cancel(&self, _symbol: &str, _ids: &[OrderId]) {}
}

/// How a fill was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillChannel {
    Stream,
    Poll,
}

impl FillChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedFill {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub price: Price,
    /// Zero when the exchange no longer reports the order.
    pub filled: Size,
    pub channel: FillChannel,
}

/// Fills detected in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillBatch {
    pub symbol: String,
    pub fills: Vec<DetectedFill>,
}

impl FillBatch {
    /// Price of the last fill with a known amount.
    pub fn last_price(&self) -> Option<Price> {
        last_fill_price(&self.fills)
    }
}

/// Price of the last fill in `fills` with a known amount.
pub fn last_fill_price(fills: &[DetectedFill]) -> Option<Price> {
    fills
        .iter()
        .rev()
        .find(|f| f.filled.is_positive())
        .map(|f| f.price)
}

/// Poll cadence and pauses.
#[derive(Debug, Clone, Copy)]
pub struct FillWatchConfig {
    pub check_interval: Duration,
    pub watch_timeout: Duration,
    pub notify_pause: Duration,
}

impl Default for FillWatchConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            watch_timeout: Duration::from_secs(30),
            notify_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WatchEntry {
    side: OrderSide,
    price: Price,
}

#[derive(Debug, Default)]
struct Detection {
    fills: Vec<DetectedFill>,
    cancelled: Vec<OrderId>,
}

/// Registry of resting orders awaiting a fill.
pub struct FillWatcher {
    symbol: String,
    config: FillWatchConfig,
    registry: DashMap<OrderId, WatchEntry>,
    /// Orders we asked the exchange to cancel, kept until it confirms.
    cancelling: DashMap<OrderId, WatchEntry>,
    watch_started: Mutex<Option<Instant>>,
    pending: Mutex<Vec<DetectedFill>>,
    sink: Arc<dyn FillSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl FillWatcher {
    pub fn new(
        symbol: impl Into<String>,
        config: FillWatchConfig,
        sink: Arc<dyn FillSink>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            config,
            registry: DashMap::new(),
            cancelling: DashMap::new(),
            watch_started: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            sink,
            metrics: Arc::new(NoopSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> FillWatchConfig {
        self.config
    }

    /// Start watching `orders`. Non-open orders are ignored.
    pub fn register(&self, orders: &[Order]) {
        let mut added = 0;
        for order in orders.iter().filter(|o| o.is_open() && o.symbol == self.symbol) {
            self.cancelling.remove(&order.id);
            self.registry.insert(
                order.id.clone(),
                WatchEntry {
                    side: order.side,
                    price: order.price,
                },
            );
            added += 1;
        }
        if added > 0 {
            self.watch_started.lock().get_or_insert_with(Instant::now);
            debug!(
                symbol = %self.symbol,
                added,
                watched = self.registry.len(),
                "Orders registered"
            );
        }
    }

    /// Stop watching `ids` because we are about to cancel them.
    ///
    /// They stay tracked until the exchange confirms the cancel.
    pub fn forget(&self, ids: &[OrderId]) {
        for id in ids {
            if let Some((id, entry)) = self.registry.remove(id) {
                self.cancelling.insert(id, entry);
            }
        }
        self.reset_if_idle();
    }

    /// `forget` every watched order, before cancelling all of them.
    pub fn forget_all(&self) {
        let ids: Vec<OrderId> = self.registry.iter().map(|e| e.key().clone()).collect();
        self.forget(&ids);
    }

    /// End the watch. Orders awaiting our own cancel stay tracked.
    pub fn clear(&self) {
        self.registry.clear();
        *self.watch_started.lock() = None;
    }

    fn reset_if_idle(&self) {
        if self.registry.is_empty() {
            *self.watch_started.lock() = None;
        }
    }

    /// Whether a watch is in progress.
    pub fn is_active(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn watched(&self) -> usize {
        self.registry.len()
    }

    /// Orders cancelled by us and not yet confirmed.
    pub fn cancelling(&self) -> usize {
        self.cancelling.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Remove `id` from whichever set tracks it.
    fn take(&self, id: &OrderId) -> Option<WatchEntry> {
        self.registry
            .remove(id)
            .or_else(|| self.cancelling.remove(id))
            .map(|(_, entry)| entry)
    }

    /// A cancel of a registered order is external; of a forgotten one, ours.
    fn on_cancelled(&self, id: &OrderId, detection: &mut Detection) {
        if self.registry.remove(id).is_some() {
            detection.cancelled.push(id.clone());
        } else {
            self.cancelling.remove(id);
        }
    }

    fn report_cancelled(&self, ids: &[OrderId]) {
        if ids.is_empty() {
            return;
        }
        info!(
            symbol = %self.symbol,
            orders = ids.len(),
            "Watched orders cancelled outside the engine"
        );
        self.sink.external_cancel(&self.symbol, ids);
    }

    /// Stream channel: consume pushed order events.
    pub async fn on_order_updates(&self, updates: &[Order]) -> EngineResult<()> {
        let mut detection = Detection::default();
        for order in updates.iter().filter(|o| o.symbol == self.symbol) {
            match order.status {
                OrderStatus::Filled => {
                    if self.take(&order.id).is_some() {
                        detection.fills.push(DetectedFill {
                            order_id: order.id.clone(),
                            side: order.side,
                            price: order.price,
                            filled: order.filled,
                            channel: FillChannel::Stream,
                        });
                    }
                }
                OrderStatus::Canceled => self.on_cancelled(&order.id, &mut detection),
                OrderStatus::Open => {}
            }
        }
        self.report_cancelled(&detection.cancelled);
        if detection.fills.is_empty() {
            self.reset_if_idle();
            return Ok(());
        }
        self.resolve(detection.fills).await
    }

    /// Compare tracked ids against the exchange's open orders.
    async fn detect(&self, gateway: &dyn ExchangeGateway) -> EngineResult<Detection> {
        let mut detection = Detection::default();
        if self.registry.is_empty() && self.cancelling.is_empty() {
            return Ok(detection);
        }
        let open = gateway.fetch_open_orders(&self.symbol).await?;
        let open_ids: HashSet<&OrderId> = open.iter().map(|o| &o.id).collect();
        let missing: Vec<OrderId> = self
            .registry
            .iter()
            .chain(self.cancelling.iter())
            .filter(|e| !open_ids.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for id in missing {
            let details = gateway.fetch_order(&id, &self.symbol).await;
            match &details {
                Ok(order) if order.status == OrderStatus::Open => continue,
                Ok(order) if order.status == OrderStatus::Canceled => {
                    self.on_cancelled(&id, &mut detection);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    // Ours to cancel and already pruned by the exchange.
                    if self.cancelling.remove(&id).is_some() {
                        continue;
                    }
                    debug!(
                        symbol = %self.symbol,
                        order_id = %id,
                        error = %e,
                        "Fill details unavailable"
                    );
                }
            }
            let Some(entry) = self.take(&id) else {
                continue;
            };
            let fill = match details {
                Ok(order) => DetectedFill {
                    order_id: id,
                    side: order.side,
                    price: order.price,
                    filled: order.filled,
                    channel: FillChannel::Poll,
                },
                Err(_) => DetectedFill {
                    order_id: id,
                    side: entry.side,
                    price: entry.price,
                    filled: Size::ZERO,
                    channel: FillChannel::Poll,
                },
            };
            detection.fills.push(fill);
        }
        Ok(detection)
    }

    /// Poll channel: registered ids missing from the open order list are fills.
    ///
    /// Returns the number of fills detected. Orders the exchange reports as
    /// cancelled are not fills.
    pub async fn poll(&self, gateway: &dyn ExchangeGateway) -> EngineResult<usize> {
        let Detection { fills, cancelled } = self.detect(gateway).await?;
        self.report_cancelled(&cancelled);
        let detected = fills.len();
        if detected == 0 {
            self.reset_if_idle();
            return Ok(0);
        }
        self.resolve(fills).await?;
        Ok(detected)
    }

    /// Poll without notifying: detected fills are queued for the next
    /// `flush` and returned.
    ///
    /// A reconciliation pass calls this before cancelling watched orders,
    /// while it still holds the trigger consumer.
    pub async fn settle(&self, gateway: &dyn ExchangeGateway) -> EngineResult<Vec<DetectedFill>> {
        let Detection { fills, cancelled } = self.detect(gateway).await?;
        self.report_cancelled(&cancelled);
        if fills.is_empty() {
            self.reset_if_idle();
        } else {
            self.record(&fills);
        }
        Ok(fills)
    }

    fn record(&self, fills: &[DetectedFill]) {
        self.clear();
        for fill in fills {
            self.metrics.fill_detected(&self.symbol, fill.channel.as_str());
            info!(
                symbol = %self.symbol,
                order_id = %fill.order_id,
                side = %fill.side,
                price = %fill.price,
                filled = %fill.filled,
                channel = fill.channel.as_str(),
                "Fill detected"
            );
        }
        self.pending.lock().extend_from_slice(fills);
    }

    async fn resolve(&self, fills: Vec<DetectedFill>) -> EngineResult<()> {
        self.record(&fills);
        self.flush().await
    }

    /// Hand pending fills to the sink; they are kept if it fails.
    pub async fn flush(&self) -> EngineResult<()> {
        let fills = std::mem::take(&mut *self.pending.lock());
        if fills.is_empty() {
            return Ok(());
        }
        let batch = FillBatch {
            symbol: self.symbol.clone(),
            fills,
        };
        if let Err(e) = self.sink.notify(batch.clone()).await {
            let mut pending = self.pending.lock();
            let newer = std::mem::replace(&mut *pending, batch.fills);
            pending.extend(newer);
            return Err(e);
        }
        Ok(())
    }

    /// One poll-channel cycle: retry pending notifications, then poll open
    /// orders while anything is tracked.
    pub async fn check(&self, gateway: &dyn ExchangeGateway) -> EngineResult<()> {
        self.flush().await?;
        if self.registry.is_empty() && self.cancelling.is_empty() {
            return Ok(());
        }

        let timed_out = {
            let mut started = self.watch_started.lock();
            match *started {
                Some(at) if at.elapsed() >= self.config.watch_timeout => {
                    *started = Some(Instant::now());
                    true
                }
                _ => false,
            }
        };
        if timed_out {
            info!(
                symbol = %self.symbol,
                watched = self.registry.len(),
                timeout_secs = self.config.watch_timeout.as_secs(),
                "Fill watch timed out, checking open orders"
            );
        }

        self.poll(gateway).await.map(|_| ())
    }
}
