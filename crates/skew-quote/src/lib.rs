//! Quote computation for the skew market-making engine.
//!
//! Provides:
//! - Inventory-skewed spread curves with a 0.5 balance point
//! - Fixed / dynamic / hybrid spread modes driven by volatility
//! - ATR-based volatility tracking over a bounded candle window
//!
//! # Architecture
//!
//! ```text
//! Candle stream → VolatilityTracker ──► volatility_factor()
//!                                              │
//! Positions + balance → InventoryExposure ─────┤
//!                                              ▼
//!                              compute_quote() → Quote {buy, sell, basis}
//! ```
//!
//! Everything here is synchronous and free of I/O.

pub mod config;
pub mod error;
pub mod inventory;
pub mod quote_engine;
pub mod volatility;

pub use config::{QuoteConfig, SpreadMode, VolatilityConfig};
pub use error::{QuoteError, QuoteResult};
pub use inventory::InventoryExposure;
pub use quote_engine::{
    compute_quote, compute_spreads, effective_bounds, volatility_factor, Quote, SpreadBounds,
};
pub use volatility::{VolatilitySample, VolatilityTracker};
