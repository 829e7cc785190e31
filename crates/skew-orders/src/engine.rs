//! Per-instrument engine runtime.
//!
//! Wires the state store, fill watcher, reconciler and recovery coordinator
//! for one symbol and supervises its tasks:
//!
//! ```text
//! order book ─┐
//! balance    ─┤ (state only)
//! positions  ─┤
//! orders     ─┼──► StateStore ◄── reconciler reads snapshots
//! candles    ─┘        │
//!                      ▼
//! triggers (mpsc) ──► reconcile worker ──► OrderReconciler
//!     ▲                                        │ recoverable error
//!     ├── price moves                          ▼
//!     ├── FillWatcher (stream + poll)   RecoveryCoordinator
//!     │                                        ▲
//!     └── health check (no-order watchdog)     │ poll / health failures
//! ```
//!
//! Every task stops at its next suspension point once the shared
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skew_core::{Balance, BookTop, Candle, MetricsSink, Order, OrderId, Position};
use skew_quote::{QuoteConfig, VolatilityConfig, VolatilityTracker};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, GatewayResult};
use crate::fill_watcher::{FillBatch, FillSink, FillWatchConfig, FillWatcher};
use crate::gateway::{BoxFuture, DynGateway};
use crate::reconciler::{OrderReconciler, ReconcileMode};
use crate::recovery::RecoveryCoordinator;
use crate::state::StateStore;

const TRIGGER_CAPACITY: usize = 64;
const HEALTH_RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Triggers
// ============================================================================

/// Reason to run a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    /// Book moved; the pass decides whether orders drifted.
    Price,
    /// Fills detected; the worker waits the cool-down first.
    Fill(FillBatch),
    /// No order has rested for the no-order timeout.
    NoOrders,
    /// Watched orders were cancelled outside the engine.
    ExternalCancel,
}

/// Forwards detected fills to the reconcile worker.
pub struct TriggerFillSink {
    state: Arc<StateStore>,
    triggers: mpsc::Sender<Trigger>,
}

impl TriggerFillSink {
    pub fn new(state: Arc<StateStore>, triggers: mpsc::Sender<Trigger>) -> Self {
        Self { state, triggers }
    }
}

impl FillSink for TriggerFillSink {
    fn notify(&self, batch: FillBatch) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            if let Some(price) = batch.last_price() {
                self.state.record_fill_price(price);
            }
            self.triggers
                .send(Trigger::Fill(batch))
                .await
                .map_err(|_| EngineError::Stopped)
        })
    }

    fn external_cancel(&self, symbol: &str, ids: &[OrderId]) {
        debug!(symbol, orders = ids.len(), "Requesting reconciliation after external cancel");
        // Full channel means a pass is already queued.
        let _ = self.triggers.try_send(Trigger::ExternalCancel);
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Capped exponential delay: `base * 2^(attempt-1)`, at most `max`.
pub fn calculate_backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Reconnect backoff owned by one stream task.
#[derive(Debug)]
pub struct StreamBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl StreamBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff_delay(self.base, self.max, self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    OrderBook,
    Balance,
    Positions,
    Orders,
    Candles,
}

impl StreamKind {
    const ALL: [StreamKind; 5] = [
        StreamKind::OrderBook,
        StreamKind::Balance,
        StreamKind::Positions,
        StreamKind::Orders,
        StreamKind::Candles,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::OrderBook => "order_book",
            Self::Balance => "balance",
            Self::Positions => "positions",
            Self::Orders => "orders",
            Self::Candles => "candles",
        }
    }
}

enum StreamEvent {
    Book(BookTop),
    Balance(Balance),
    Positions(Vec<Position>),
    Orders(Vec<Order>),
    Candles(Vec<Candle>),
}

// ============================================================================
// Engine
// ============================================================================

/// Everything one instrument needs to run.
#[derive(Debug, Clone)]
pub struct InstrumentSettings {
    pub symbol: String,
    pub leverage: u32,
    pub engine: EngineConfig,
    pub quote: QuoteConfig,
    pub volatility: VolatilityConfig,
}

struct EngineContext {
    symbol: String,
    config: EngineConfig,
    timeframe: String,
    gateway: DynGateway,
    state: Arc<StateStore>,
    volatility: Arc<RwLock<VolatilityTracker>>,
    watcher: Arc<FillWatcher>,
    reconciler: Arc<OrderReconciler>,
    recovery: Arc<RecoveryCoordinator>,
    triggers: mpsc::Sender<Trigger>,
    shutdown: CancellationToken,
}

/// A fully initialized, not yet running, instrument engine.
pub struct InstrumentEngine {
    ctx: Arc<EngineContext>,
    trigger_rx: mpsc::Receiver<Trigger>,
}

impl InstrumentEngine {
    /// Validate configuration, prepare the account and load initial state.
    pub async fn build(
        settings: InstrumentSettings,
        gateway: DynGateway,
        metrics: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> EngineResult<Self> {
        let InstrumentSettings {
            symbol,
            leverage,
            engine,
            quote,
            volatility,
        } = settings;
        engine.validate()?;
        quote.validate()?;
        volatility.validate()?;

        let instrument = gateway.load_instrument(&symbol).await?;
        info!(
            symbol = %symbol,
            tick_size = %instrument.tick_size,
            min_amount = %instrument.min_amount,
            direction = %engine.direction,
            incremental = engine.incremental_enabled,
            "Instrument loaded"
        );

        if engine.hedge_mode {
            if let Err(e) = gateway.set_hedge_mode(&symbol).await {
                warn!(symbol = %symbol, error = %e, "Failed to enable hedge mode");
            }
        }
        if let Err(e) = gateway.set_leverage(&symbol, leverage).await {
            warn!(symbol = %symbol, leverage, error = %e, "Failed to set leverage");
        }

        let state = Arc::new(StateStore::new(symbol.clone()));
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);

        let watcher = Arc::new(
            FillWatcher::new(
                symbol.clone(),
                FillWatchConfig {
                    check_interval: engine.fill_check_interval(),
                    watch_timeout: engine.fill_watch_timeout(),
                    notify_pause: engine.fill_notify_pause(),
                },
                Arc::new(TriggerFillSink::new(state.clone(), triggers.clone())),
            )
            .with_metrics(metrics.clone()),
        );

        let timeframe = volatility.timeframe.clone();
        let history_candles = volatility.history_candles;
        let tracker = Arc::new(RwLock::new(VolatilityTracker::new(symbol.clone(), volatility)));

        let reconciler = Arc::new(
            OrderReconciler::new(
                instrument,
                engine.clone(),
                quote,
                gateway.clone(),
                state.clone(),
                tracker.clone(),
                watcher.clone(),
            )?
            .with_metrics(metrics.clone()),
        );
        let recovery = Arc::new(
            RecoveryCoordinator::new(reconciler.clone(), engine.recovery_delay(), shutdown.clone())
                .with_metrics(metrics),
        );

        reconciler.refresh_state().await?;

        match gateway
            .fetch_ohlcv(&symbol, &timeframe, history_candles)
            .await
        {
            Ok(candles) => {
                let count = candles.len();
                let volatility = tracker.write().warm_up(candles);
                info!(
                    symbol = %symbol,
                    candles = count,
                    volatility = ?volatility,
                    "Volatility warmed up"
                );
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "Candle history unavailable"),
        }

        Ok(Self {
            ctx: Arc::new(EngineContext {
                symbol,
                config: engine,
                timeframe,
                gateway,
                state,
                volatility: tracker,
                watcher,
                reconciler,
                recovery,
                triggers,
                shutdown,
            }),
            trigger_rx,
        })
    }

    /// Start every task and run the first reconciliation.
    pub fn spawn(self) -> EngineHandle {
        let Self { ctx, trigger_rx } = self;
        let _ = ctx.triggers.try_send(Trigger::Startup);

        let mut tasks = Vec::with_capacity(StreamKind::ALL.len() + 3);
        tasks.push(tokio::spawn(run_reconcile_worker(ctx.clone(), trigger_rx)));
        for kind in StreamKind::ALL {
            tasks.push(tokio::spawn(run_stream(ctx.clone(), kind)));
        }
        tasks.push(tokio::spawn(run_fill_watch(ctx.clone())));
        tasks.push(tokio::spawn(run_health_check(ctx.clone())));

        info!(symbol = %ctx.symbol, tasks = tasks.len(), "Engine started");
        EngineHandle { ctx, tasks }
    }
}

/// Handle to a running instrument engine.
pub struct EngineHandle {
    ctx: Arc<EngineContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn symbol(&self) -> &str {
        &self.ctx.symbol
    }

    pub fn state(&self) -> Arc<StateStore> {
        self.ctx.state.clone()
    }

    pub fn watcher(&self) -> Arc<FillWatcher> {
        self.ctx.watcher.clone()
    }

    pub fn reconciler(&self) -> Arc<OrderReconciler> {
        self.ctx.reconciler.clone()
    }

    pub fn recovery(&self) -> Arc<RecoveryCoordinator> {
        self.ctx.recovery.clone()
    }

    /// Stop all tasks, waiting at most `grace`, then optionally cancel
    /// resting orders.
    pub async fn shutdown(self, grace: Duration) {
        let symbol = self.ctx.symbol.clone();
        self.ctx.shutdown.cancel();

        if tokio::time::timeout(grace, join_all(self.tasks)).await.is_err() {
            warn!(
                symbol = %symbol,
                grace_secs = grace.as_secs(),
                "Engine tasks did not stop in time"
            );
        }

        if self.ctx.config.cancel_orders_on_shutdown {
            if let Err(e) = self.ctx.reconciler.cancel_all().await {
                warn!(symbol = %symbol, error = %e, "Failed to cancel orders on shutdown");
            }
        }
        info!(symbol = %symbol, "Engine stopped");
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn run_reconcile_worker(ctx: Arc<EngineContext>, mut rx: mpsc::Receiver<Trigger>) {
    loop {
        let first = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            trigger = rx.recv() => match trigger {
                Some(t) => t,
                None => break,
            },
        };

        // Coalesce whatever queued up meanwhile into one pass.
        let mut triggers = vec![first];
        while let Ok(next) = rx.try_recv() {
            triggers.push(next);
        }
        let fills: usize = triggers
            .iter()
            .map(|t| match t {
                Trigger::Fill(batch) => batch.fills.len(),
                _ => 0,
            })
            .sum();

        if fills > 0 {
            debug!(
                symbol = %ctx.symbol,
                fills,
                cool_down_ms = ctx.config.order_cool_down_ms,
                "Fill received, cooling down"
            );
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(ctx.config.order_cool_down()) => {}
            }
        }

        if ctx.recovery.is_recovering() {
            debug!(symbol = %ctx.symbol, "Recovery in progress, skipping reconciliation");
            continue;
        }

        match ctx.reconciler.reconcile(ReconcileMode::Normal).await {
            Ok(outcome) => debug!(
                symbol = %ctx.symbol,
                outcome = ?outcome,
                triggers = triggers.len(),
                "Reconciliation done"
            ),
            Err(e) if e.is_recoverable() => {
                warn!(symbol = %ctx.symbol, error = %e, kind = e.kind(), "Reconciliation failed");
                ctx.recovery.enter(&e);
            }
            Err(e) => {
                error!(
                    symbol = %ctx.symbol,
                    error = %e,
                    kind = e.kind(),
                    "Reconciliation abandoned"
                );
            }
        }
    }
    debug!(symbol = %ctx.symbol, "Reconcile worker stopped");
}

impl EngineContext {
    async fn next_event(&self, kind: StreamKind) -> GatewayResult<StreamEvent> {
        let symbol = self.symbol.as_str();
        match kind {
            StreamKind::OrderBook => self
                .gateway
                .watch_order_book(symbol)
                .await
                .map(StreamEvent::Book),
            StreamKind::Balance => self
                .gateway
                .watch_balance(&self.config.coin)
                .await
                .map(StreamEvent::Balance),
            StreamKind::Positions => self
                .gateway
                .watch_positions(symbol)
                .await
                .map(StreamEvent::Positions),
            StreamKind::Orders => self
                .gateway
                .watch_orders(symbol)
                .await
                .map(StreamEvent::Orders),
            StreamKind::Candles => self
                .gateway
                .watch_ohlcv(symbol, &self.timeframe)
                .await
                .map(StreamEvent::Candles),
        }
    }

    async fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Book(book) => {
                self.state.apply_book(book);
                // Full channel means a pass is already queued.
                let _ = self.triggers.try_send(Trigger::Price);
            }
            StreamEvent::Balance(balance) => self.state.apply_balance(balance),
            StreamEvent::Positions(positions) => self.state.apply_positions(&positions),
            StreamEvent::Orders(orders) => {
                self.state.apply_order_updates(&orders);
                if let Err(e) = self.watcher.on_order_updates(&orders).await {
                    warn!(symbol = %self.symbol, error = %e, "Fill notification deferred");
                }
            }
            StreamEvent::Candles(candles) => {
                let mut tracker = self.volatility.write();
                for candle in candles {
                    tracker.push_candle(candle);
                }
            }
        }
    }

    async fn health_check(&self) -> EngineResult<()> {
        if self.recovery.is_recovering() {
            return Ok(());
        }
        self.reconciler.sync_open_orders().await?;

        let snapshot = self.state.snapshot();
        if !self.watcher.is_active() && !snapshot.open_orders.is_empty() {
            self.watcher.register(&snapshot.open_orders);
            info!(
                symbol = %self.symbol,
                orders = snapshot.open_orders.len(),
                "Live orders re-registered for fill watch"
            );
        }

        if let Some(since) = snapshot.orders_empty_since {
            let idle = since.elapsed();
            if idle >= self.config.no_order_timeout() {
                warn!(
                    symbol = %self.symbol,
                    idle_secs = idle.as_secs(),
                    "No resting orders, forcing reconciliation"
                );
                let _ = self.triggers.try_send(Trigger::NoOrders);
            }
        }

        debug!(
            symbol = %self.symbol,
            open_orders = snapshot.open_orders.len(),
            watched = self.watcher.watched(),
            volatility = ?self.volatility.read().volatility(),
            long = %snapshot.positions.long_size,
            short = %snapshot.positions.short_size,
            equity = %snapshot.account.equity,
            "Health check"
        );
        Ok(())
    }
}

async fn run_stream(ctx: Arc<EngineContext>, kind: StreamKind) {
    let mut backoff = StreamBackoff::new(
        ctx.config.stream_backoff_base(),
        ctx.config.stream_backoff_max(),
    );

    loop {
        let next = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            next = ctx.next_event(kind) => next,
        };

        match next {
            Ok(event) => {
                backoff.reset();
                ctx.handle_event(event).await;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    symbol = %ctx.symbol,
                    stream = kind.as_str(),
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Stream error, backing off"
                );
                if e.is_network() {
                    ctx.recovery.enter(&EngineError::from(e));
                }
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(symbol = %ctx.symbol, stream = kind.as_str(), "Stream stopped");
}

async fn run_health_check(ctx: Arc<EngineContext>) {
    let period = ctx.config.health_check_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = ctx.health_check().await {
            warn!(symbol = %ctx.symbol, error = %e, kind = e.kind(), "Health check failed");
            if e.is_recoverable() {
                ctx.recovery.enter(&e);
            }
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(HEALTH_RETRY_DELAY) => {}
            }
            ticker.reset();
        }
    }
    debug!(symbol = %ctx.symbol, "Health check stopped");
}

/// Poll channel of the fill watcher.
async fn run_fill_watch(ctx: Arc<EngineContext>) {
    let config = ctx.watcher.config();
    let mut ticker = tokio::time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = ctx.watcher.check(ctx.gateway.as_ref()).await {
            warn!(symbol = %ctx.symbol, error = %e, kind = e.kind(), "Fill check failed");
            if e.is_recoverable() {
                ctx.recovery.enter(&e);
            }
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.notify_pause) => {}
            }
        }
    }
    debug!(symbol = %ctx.symbol, "Fill watch stopped");
}
