//! Per-instrument engine configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use skew_core::DirectionMode;

use crate::error::{EngineError, EngineResult};

/// Order engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Settlement coin used for balance lookups.
    #[serde(default = "default_coin")]
    pub coin: String,

    #[serde(default)]
    pub direction: DirectionMode,

    /// Fraction of equity committed per order.
    #[serde(default = "default_order_amount_ratio")]
    pub order_amount_ratio: Decimal,

    /// Smallest notional the exchange accepts.
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: Decimal,

    /// Allowed drift of a live order, as a multiple of `base_spread`.
    #[serde(default = "default_price_deviation_factor")]
    pub price_deviation_factor: Decimal,

    /// Quote around the latest fill price when one is known.
    #[serde(default = "default_true")]
    pub use_transaction_price_basis: bool,

    /// Wait after a fill before re-quoting.
    #[serde(default = "default_order_cool_down_ms")]
    pub order_cool_down_ms: u64,

    /// Force a reconciliation if no order has rested for this long.
    #[serde(default = "default_no_order_timeout_secs")]
    pub no_order_timeout_secs: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Fixed delay between recovery attempts.
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: u64,

    /// Use the incremental planner instead of cancel-all-and-replace.
    #[serde(default)]
    pub incremental_enabled: bool,

    /// Planner price grid. Defaults to the instrument tick size.
    #[serde(default)]
    pub grid_interval: Option<Decimal>,

    #[serde(default = "default_fill_check_interval_secs")]
    pub fill_check_interval_secs: u64,

    /// Watch age after which a poll is forced.
    #[serde(default = "default_fill_watch_timeout_secs")]
    pub fill_watch_timeout_secs: u64,

    /// Pause after a failed fill notification.
    #[serde(default = "default_fill_notify_pause_ms")]
    pub fill_notify_pause_ms: u64,

    #[serde(default = "default_stream_backoff_base_ms")]
    pub stream_backoff_base_ms: u64,

    #[serde(default = "default_stream_backoff_max_ms")]
    pub stream_backoff_max_ms: u64,

    #[serde(default = "default_true")]
    pub cancel_orders_on_shutdown: bool,

    /// Switch the account to hedge mode at startup.
    #[serde(default = "default_true")]
    pub hedge_mode: bool,
}

fn default_coin() -> String {
    "USDT".to_string()
}

fn default_order_amount_ratio() -> Decimal {
    dec!(0.05)
}

fn default_min_order_notional() -> Decimal {
    dec!(5.5)
}

fn default_price_deviation_factor() -> Decimal {
    dec!(0.5)
}

fn default_true() -> bool {
    true
}

fn default_order_cool_down_ms() -> u64 {
    100
}

fn default_no_order_timeout_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_recovery_delay_secs() -> u64 {
    5
}

fn default_fill_check_interval_secs() -> u64 {
    5
}

fn default_fill_watch_timeout_secs() -> u64 {
    30
}

fn default_fill_notify_pause_ms() -> u64 {
    1000
}

fn default_stream_backoff_base_ms() -> u64 {
    1000
}

fn default_stream_backoff_max_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coin: default_coin(),
            direction: DirectionMode::default(),
            order_amount_ratio: default_order_amount_ratio(),
            min_order_notional: default_min_order_notional(),
            price_deviation_factor: default_price_deviation_factor(),
            use_transaction_price_basis: true,
            order_cool_down_ms: default_order_cool_down_ms(),
            no_order_timeout_secs: default_no_order_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            recovery_delay_secs: default_recovery_delay_secs(),
            incremental_enabled: false,
            grid_interval: None,
            fill_check_interval_secs: default_fill_check_interval_secs(),
            fill_watch_timeout_secs: default_fill_watch_timeout_secs(),
            fill_notify_pause_ms: default_fill_notify_pause_ms(),
            stream_backoff_base_ms: default_stream_backoff_base_ms(),
            stream_backoff_max_ms: default_stream_backoff_max_ms(),
            cancel_orders_on_shutdown: true,
            hedge_mode: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::Validation(msg));

        if self.coin.is_empty() {
            return invalid("coin must not be empty".to_string());
        }
        if self.order_amount_ratio <= Decimal::ZERO || self.order_amount_ratio > Decimal::ONE {
            return invalid(format!(
                "order_amount_ratio must be in (0, 1], got {}",
                self.order_amount_ratio
            ));
        }
        if self.min_order_notional < Decimal::ZERO {
            return invalid("min_order_notional must not be negative".to_string());
        }
        if self.price_deviation_factor <= Decimal::ZERO {
            return invalid(format!(
                "price_deviation_factor must be positive, got {}",
                self.price_deviation_factor
            ));
        }
        if let Some(grid) = self.grid_interval {
            if grid <= Decimal::ZERO {
                return invalid(format!("grid_interval must be positive, got {grid}"));
            }
        }
        if self.fill_check_interval_secs == 0 || self.health_check_interval_secs == 0 {
            return invalid("check intervals must be at least 1 second".to_string());
        }
        if self.stream_backoff_base_ms == 0
            || self.stream_backoff_base_ms > self.stream_backoff_max_ms
        {
            return invalid(format!(
                "stream backoff must satisfy 0 < base <= max, got {} / {}",
                self.stream_backoff_base_ms, self.stream_backoff_max_ms
            ));
        }
        Ok(())
    }

    pub fn order_cool_down(&self) -> Duration {
        Duration::from_millis(self.order_cool_down_ms)
    }

    pub fn no_order_timeout(&self) -> Duration {
        Duration::from_secs(self.no_order_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay_secs)
    }

    pub fn fill_check_interval(&self) -> Duration {
        Duration::from_secs(self.fill_check_interval_secs)
    }

    pub fn fill_watch_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_watch_timeout_secs)
    }

    pub fn fill_notify_pause(&self) -> Duration {
        Duration::from_millis(self.fill_notify_pause_ms)
    }

    pub fn stream_backoff_base(&self) -> Duration {
        Duration::from_millis(self.stream_backoff_base_ms)
    }

    pub fn stream_backoff_max(&self) -> Duration {
        Duration::from_millis(self.stream_backoff_max_ms)
    }
}
