//! Prometheus metrics for the skew engine.
//!
//! Covers:
//! - Reconciliation passes by mode and outcome
//! - Order churn
//! - Incremental planner savings
//! - Fill detection by channel
//! - Recovery state
//! - Current quote spreads
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a programming error that should crash at
//! startup. These panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_gauge_vec, CounterVec, Encoder,
    GaugeVec, IntGaugeVec, TextEncoder,
};

use skew_core::MetricsSink;

use crate::error::{TelemetryError, TelemetryResult};

/// Reconciliation passes.
/// Labels: symbol, mode (normal/recovery), outcome (skipped/noop/executed/error)
pub static RECONCILE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "skew_reconcile_total",
        "Total reconciliation passes",
        &["symbol", "mode", "outcome"]
    )
    .unwrap()
});

/// Orders placed.
pub static ORDERS_PLACED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "skew_orders_placed_total",
        "Total orders placed",
        &["symbol"]
    )
    .unwrap()
});

/// Orders cancelled.
pub static ORDERS_CANCELLED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "skew_orders_cancelled_total",
        "Total orders cancelled",
        &["symbol"]
    )
    .unwrap()
});

/// Planner counters, mirrored from the planner's own totals.
/// Labels: symbol, counter (total_updates/action_updates/operations_saved)
pub static PLANNER_STATS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "skew_planner_stats",
        "Incremental planner counters",
        &["symbol", "counter"]
    )
    .unwrap()
});

/// Fills detected.
/// Labels: symbol, channel (stream/poll)
pub static FILLS_DETECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "skew_fills_detected_total",
        "Total fills detected",
        &["symbol", "channel"]
    )
    .unwrap()
});

/// Recovery state (1 = recovering).
pub static IN_RECOVERY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "skew_in_recovery",
        "Recovery state (1=recovering)",
        &["symbol"]
    )
    .unwrap()
});

/// Times recovery was entered.
pub static RECOVERY_ENTERED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "skew_recovery_entered_total",
        "Total recovery entries",
        &["symbol"]
    )
    .unwrap()
});

/// Current quote spread.
/// Labels: symbol, side (buy/sell)
pub static QUOTE_SPREAD: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "skew_quote_spread",
        "Current quote spread as a fraction of the basis price",
        &["symbol", "side"]
    )
    .unwrap()
});

/// Metrics helper for convenient recording.
pub struct Metrics;

impl Metrics {
    pub fn reconcile(symbol: &str, mode: &str, outcome: &str) {
        RECONCILE_TOTAL
            .with_label_values(&[symbol, mode, outcome])
            .inc();
    }

    pub fn orders_churned(symbol: &str, placed: usize, cancelled: usize) {
        if placed > 0 {
            ORDERS_PLACED_TOTAL
                .with_label_values(&[symbol])
                .inc_by(placed as f64);
        }
        if cancelled > 0 {
            ORDERS_CANCELLED_TOTAL
                .with_label_values(&[symbol])
                .inc_by(cancelled as f64);
        }
    }

    pub fn planner_stats(symbol: &str, total_updates: u64, action_updates: u64, saved: u64) {
        for (counter, value) in [
            ("total_updates", total_updates),
            ("action_updates", action_updates),
            ("operations_saved", saved),
        ] {
            PLANNER_STATS
                .with_label_values(&[symbol, counter])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    pub fn fill_detected(symbol: &str, channel: &str) {
        FILLS_DETECTED_TOTAL
            .with_label_values(&[symbol, channel])
            .inc();
    }

    pub fn recovery_state(symbol: &str, in_recovery: bool) {
        IN_RECOVERY
            .with_label_values(&[symbol])
            .set(i64::from(in_recovery));
        if in_recovery {
            RECOVERY_ENTERED_TOTAL.with_label_values(&[symbol]).inc();
        }
    }

    pub fn spreads(symbol: &str, buy_spread: f64, sell_spread: f64) {
        QUOTE_SPREAD
            .with_label_values(&[symbol, "buy"])
            .set(buy_spread);
        QUOTE_SPREAD
            .with_label_values(&[symbol, "sell"])
            .set(sell_spread);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

/// `MetricsSink` backed by the global Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn reconcile(&self, symbol: &str, mode: &str, outcome: &str) {
        Metrics::reconcile(symbol, mode, outcome);
    }

    fn orders_churned(&self, symbol: &str, placed: usize, cancelled: usize) {
        Metrics::orders_churned(symbol, placed, cancelled);
    }

    fn planner_stats(&self, symbol: &str, total_updates: u64, action_updates: u64, saved: u64) {
        Metrics::planner_stats(symbol, total_updates, action_updates, saved);
    }

    fn fill_detected(&self, symbol: &str, channel: &str) {
        Metrics::fill_detected(symbol, channel);
    }

    fn recovery_state(&self, symbol: &str, in_recovery: bool) {
        Metrics::recovery_state(symbol, in_recovery);
    }

    fn spreads(&self, symbol: &str, buy_spread: f64, sell_spread: f64) {
        Metrics::spreads(symbol, buy_spread, sell_spread);
    }
}
