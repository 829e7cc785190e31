//! Order management for the skew market-making engine.
//!
//! # Key Components
//!
//! - [`OrderReconciler`]: diffs live orders against the quote and repairs them
//! - [`IncrementalOrderPlanner`]: tick-keyed diff that only touches drifted orders
//! - [`FillWatcher`]: fill detection from order events and open-order polling
//! - [`RecoveryCoordinator`]: single-flight retry loop after recoverable failures
//! - [`InstrumentEngine`]: per-symbol runtime wiring streams, triggers and health checks
//! - [`SimulatedGateway`]: in-process exchange for paper runs and tests
//!
//! # Reconciliation triggers
//!
//! 1. Startup
//! 2. Order book update (the pass checks drift)
//! 3. Detected fill, after the order cool-down
//! 4. No resting order for the no-order timeout
//!
//! Balance and position updates only refresh state.

pub mod config;
pub mod desired;
pub mod engine;
pub mod error;
pub mod fill_watcher;
pub mod gateway;
pub mod planner;
pub mod reconciler;
pub mod recovery;
pub mod simulated;
pub mod sizing;
pub mod state;

pub use config::EngineConfig;
pub use desired::{check_orders, compute_desired_orders, orders_match_desired, MatchOutcome};
pub use engine::{
    calculate_backoff_delay, EngineHandle, InstrumentEngine, InstrumentSettings, StreamBackoff,
    Trigger, TriggerFillSink,
};
pub use error::{EngineError, EngineResult, GatewayError, GatewayResult};
pub use fill_watcher::{
    last_fill_price, DetectedFill, FillBatch, FillChannel, FillSink, FillWatchConfig, FillWatcher,
};
pub use gateway::{BoxFuture, DynGateway, ExchangeGateway};
pub use planner::{DiffPlan, ExecutionReport, GridTarget, IncrementalOrderPlanner, PlannerStats};
pub use reconciler::{OrderReconciler, ReconcileMode, ReconcileOutcome, ReconcilePhase};
pub use recovery::RecoveryCoordinator;
pub use simulated::{SimulatedGateway, SimulatedMarket};
pub use sizing::compute_order_amount;
pub use state::{EngineSnapshot, StateStore};
