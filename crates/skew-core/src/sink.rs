//! Observability hook injected into engine components.
//!
//! The engine never depends on a metrics backend directly; it reports
//! through this trait and the binary decides what, if anything, records it.

/// Receiver for engine events worth counting.
pub trait MetricsSink: Send + Sync {
    /// A reconciliation pass finished with `outcome` (e.g. "noop", "executed").
    fn reconcile(&self, symbol: &str, mode: &str, outcome: &str);

    /// Orders placed and cancelled by one pass.
    fn orders_churned(&self, symbol: &str, placed: usize, cancelled: usize);

    /// Planner counters after a planning cycle.
    fn planner_stats(&self, symbol: &str, total_updates: u64, action_updates: u64, saved: u64);

    /// A fill was detected on `channel` ("stream" or "poll").
    fn fill_detected(&self, symbol: &str, channel: &str);

    /// Recovery mode toggled.
    fn recovery_state(&self, symbol: &str, in_recovery: bool);

    /// Current quote spreads.
    fn spreads(&self, symbol: &str, buy_spread: f64, sell_spread: f64);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn reconcile(&self, _symbol: &str, _mode: &str, _outcome: &str) {}

    fn orders_churned(&self, _symbol: &str, _placed: usize, _cancelled: usize) {}

    fn planner_stats(&self, _symbol: &str, _total: u64, _action: u64, _saved: u64) {}

    fn fill_detected(&self, _symbol: &str, _channel: &str) {}

    fn recovery_state(&self, _symbol: &str, _in_recovery: bool) {}

    fn spreads(&self, _symbol: &str, _buy_spread: f64, _sell_spread: f64) {}
}
