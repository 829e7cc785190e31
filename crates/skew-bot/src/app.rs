//! Main application orchestration.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skew_core::{MetricsSink, Price};
use skew_orders::{EngineHandle, InstrumentEngine, SimulatedGateway};
use skew_telemetry::{Metrics, PrometheusSink};

use crate::config::{AppConfig, SimulationConfig};
use crate::error::AppResult;

/// Grace period for engine tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Deterministic sine-wave price path for paper trading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceOscillator {
    base: Decimal,
    amplitude: Decimal,
    period: Duration,
    tick_size: Price,
}

impl PriceOscillator {
    pub fn new(base: Decimal, amplitude: Decimal, period: Duration, tick_size: Price) -> Self {
        Self {
            base,
            amplitude,
            period,
            tick_size,
        }
    }

    pub fn from_config(sim: &SimulationConfig) -> Self {
        Self::new(
            sim.initial_price,
            sim.amplitude,
            Duration::from_secs(sim.period_secs),
            Price::new(sim.tick_size),
        )
    }

    /// Price `elapsed` into the run, floored to the tick size.
    pub fn price_at(&self, elapsed: Duration) -> Price {
        let period = self.period.as_secs_f64();
        if period <= 0.0 {
            return Price::new(self.base);
        }
        let phase = (elapsed.as_secs_f64() / period).fract() * TAU;
        let wave = Decimal::from_f64(phase.sin())
            .unwrap_or_default()
            .round_dp(8);
        Price::new(self.base * (Decimal::ONE + self.amplitude * wave)).floor_to_tick(self.tick_size)
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    shutdown: CancellationToken,
}

impl Application {
    /// Create an application from a validated configuration.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops `run` when cancelled, like Ctrl-C does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every enabled instrument and supervise until shutdown.
    pub async fn run(self) -> AppResult<()> {
        let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusSink);
        let sim = &self.config.simulation;

        let mut prepared = Vec::new();
        for instrument in self.config.enabled_instruments() {
            let gateway = Arc::new(SimulatedGateway::new(sim.market(&instrument.symbol)));
            let engine = InstrumentEngine::build(
                self.config.settings_for(instrument),
                gateway.clone(),
                sink.clone(),
                self.shutdown.child_token(),
            )
            .await?;
            prepared.push((gateway, engine));
        }

        let oscillator = PriceOscillator::from_config(sim);
        let mut engines = Vec::with_capacity(prepared.len());
        let mut feeds = Vec::with_capacity(prepared.len());
        for (gateway, engine) in prepared {
            feeds.push(spawn_price_feed(
                gateway,
                oscillator,
                sim.step(),
                self.shutdown.clone(),
            ));
            engines.push(engine.spawn());
        }
        info!(instruments = engines.len(), "Paper trading started");

        let stats_enabled = self.config.telemetry.stats_interval_secs > 0;
        let stats_period = Duration::from_secs(self.config.telemetry.stats_interval_secs.max(1));
        let mut stats = tokio::time::interval_at(Instant::now() + stats_period, stats_period);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = stats.tick(), if stats_enabled => log_stats(&engines),
            }
        }

        self.shutdown.cancel();
        for result in join_all(feeds).await {
            if let Err(e) = result {
                warn!(error = %e, "Price feed task failed");
            }
        }
        join_all(engines.into_iter().map(|h| h.shutdown(SHUTDOWN_GRACE))).await;

        log_metrics();
        info!("Shutdown complete");
        Ok(())
    }
}

fn spawn_price_feed(
    gateway: Arc<SimulatedGateway>,
    oscillator: PriceOscillator,
    step: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + step, step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let price = oscillator.price_at(started.elapsed());
            let fills = gateway.set_price(price);
            if !fills.is_empty() {
                debug!(
                    symbol = %gateway.symbol(),
                    price = %price,
                    fills = fills.len(),
                    "Simulated fills"
                );
            }
        }
    })
}

fn log_stats(engines: &[EngineHandle]) {
    for engine in engines {
        let snapshot = engine.state().snapshot();
        info!(
            symbol = %engine.symbol(),
            open_orders = snapshot.open_orders.len(),
            long = %snapshot.positions.long_size,
            short = %snapshot.positions.short_size,
            equity = %snapshot.account.equity,
            watched = engine.watcher().watched(),
            recovering = engine.recovery().is_recovering(),
            "Engine stats"
        );
    }
    log_metrics();
}

fn log_metrics() {
    match Metrics::render() {
        Ok(text) => debug!(metrics = %text, "Metrics snapshot"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::config::InstrumentConfig;

    fn oscillator() -> PriceOscillator {
        PriceOscillator::new(
            dec!(100),
            dec!(0.01),
            Duration::from_secs(100),
            Price::new(dec!(0.01)),
        )
    }

    #[test]
    fn test_oscillator_extremes() {
        let osc = oscillator();
        assert_eq!(osc.price_at(Duration::ZERO), Price::new(dec!(100)));
        assert_eq!(osc.price_at(Duration::from_secs(25)), Price::new(dec!(101)));
        assert_eq!(osc.price_at(Duration::from_secs(75)), Price::new(dec!(99)));
    }

    #[test]
    fn test_oscillator_is_periodic_and_on_tick() {
        let osc = oscillator();
        for secs in [3, 17, 42, 88] {
            let a = osc.price_at(Duration::from_secs(secs));
            let b = osc.price_at(Duration::from_secs(secs + 100));
            assert_eq!(a, b);
            assert_eq!(a, a.floor_to_tick(Price::new(dec!(0.01))));
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        match Application::new(AppConfig::default()) {
            Err(err) => assert!(err.to_string().contains("no enabled instruments")),
            Ok(_) => panic!("config without instruments accepted"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let config = AppConfig {
            instruments: vec![InstrumentConfig {
                symbol: "BTC/USDT".to_string(),
                enabled: true,
                leverage: 2,
            }],
            ..Default::default()
        };
        let app = Application::new(config).unwrap();
        let token = app.shutdown_token();
        let run = tokio::spawn(app.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        token.cancel();
        run.await.unwrap().unwrap();
    }
}
