//! Application configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use skew_core::{Price, Size};
use skew_orders::{EngineConfig, InstrumentSettings, SimulatedMarket};
use skew_quote::{QuoteConfig, VolatilityConfig};

use crate::error::{AppError, AppResult};

/// Logging and stats output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Level for our own crates; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Periodic stats log line. Zero disables it.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

/// Simulated market the paper gateway runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_initial_price")]
    pub initial_price: Decimal,

    /// Starting free balance in the settlement coin.
    #[serde(default = "default_balance")]
    pub balance: Decimal,

    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,

    #[serde(default = "default_min_amount")]
    pub min_amount: Decimal,

    /// Oscillation amplitude as a fraction of the initial price.
    #[serde(default = "default_amplitude")]
    pub amplitude: Decimal,

    /// Length of one full oscillation.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Price update cadence.
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
}

fn default_initial_price() -> Decimal {
    dec!(100)
}

fn default_balance() -> Decimal {
    dec!(1000)
}

fn default_tick_size() -> Decimal {
    dec!(0.01)
}

fn default_min_amount() -> Decimal {
    dec!(0.001)
}

fn default_amplitude() -> Decimal {
    dec!(0.005)
}

fn default_period_secs() -> u64 {
    300
}

fn default_step_ms() -> u64 {
    1000
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_price: default_initial_price(),
            balance: default_balance(),
            tick_size: default_tick_size(),
            min_amount: default_min_amount(),
            amplitude: default_amplitude(),
            period_secs: default_period_secs(),
            step_ms: default_step_ms(),
        }
    }
}

impl SimulationConfig {
    /// Market definition for `symbol`.
    pub fn market(&self, symbol: &str) -> SimulatedMarket {
        let mut market = SimulatedMarket::new(symbol, self.initial_price, self.balance);
        market.instrument.tick_size = Price::new(self.tick_size);
        market.instrument.min_amount = Size::new(self.min_amount);
        market.instrument.amount_step = Size::new(self.min_amount);
        market
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }
}

/// One traded instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

fn default_true() -> bool {
    true
}

fn default_leverage() -> u32 {
    1
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub quote: QuoteConfig,

    #[serde(default)]
    pub volatility: VolatilityConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Reject configurations that must not start trading.
    pub fn validate(&self) -> AppResult<()> {
        self.quote
            .validate()
            .map_err(|e| AppError::Config(format!("[quote] {e}")))?;
        self.volatility
            .validate()
            .map_err(|e| AppError::Config(format!("[volatility] {e}")))?;
        self.engine
            .validate()
            .map_err(|e| AppError::Config(format!("[engine] {e}")))?;

        let sim = &self.simulation;
        if sim.initial_price <= Decimal::ZERO
            || sim.balance <= Decimal::ZERO
            || sim.tick_size <= Decimal::ZERO
            || sim.min_amount <= Decimal::ZERO
        {
            return Err(AppError::Config(
                "[simulation] initial_price, balance, tick_size and min_amount must be positive"
                    .to_string(),
            ));
        }
        if sim.amplitude < Decimal::ZERO || sim.amplitude >= Decimal::ONE {
            return Err(AppError::Config(format!(
                "[simulation] amplitude must be in [0, 1), got {}",
                sim.amplitude
            )));
        }
        if sim.period_secs == 0 || sim.step_ms == 0 {
            return Err(AppError::Config(
                "[simulation] period_secs and step_ms must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if instrument.symbol.is_empty() {
                return Err(AppError::Config("instrument symbol must not be empty".to_string()));
            }
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate instrument {}",
                    instrument.symbol
                )));
            }
            if instrument.leverage == 0 {
                return Err(AppError::Config(format!(
                    "leverage for {} must be at least 1",
                    instrument.symbol
                )));
            }
        }
        if self.enabled_instruments().next().is_none() {
            return Err(AppError::Config("no enabled instruments".to_string()));
        }
        Ok(())
    }

    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentConfig> {
        self.instruments.iter().filter(|i| i.enabled)
    }

    /// Engine settings for one instrument.
    pub fn settings_for(&self, instrument: &InstrumentConfig) -> InstrumentSettings {
        InstrumentSettings {
            symbol: instrument.symbol.clone(),
            leverage: instrument.leverage,
            engine: self.engine.clone(),
            quote: self.quote.clone(),
            volatility: self.volatility.clone(),
        }
    }
}
