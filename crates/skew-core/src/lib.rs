//! Core domain types for the skew market-making engine.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Price`, `Size`, `PriceTick`: precision-safe numeric types
//! - `Order`, `OrderRequest`, `OrderIntent`: order lifecycle types
//! - `Position`, `NetPositionView`, `AccountState`: exposure snapshots
//! - `Candle`, `InstrumentSpec`, `DirectionMode`: market inputs
//! - `MetricsSink`: optional observability hook injected into the engine

pub mod decimal;
pub mod error;
pub mod market;
pub mod order;
pub mod position;
pub mod sink;

pub use decimal::{Price, PriceTick, Size};
pub use error::{CoreError, Result};
pub use market::{BookTop, Candle, DirectionMode, InstrumentSpec, Ticker};
pub use order::{Order, OrderId, OrderIntent, OrderRequest, OrderRole, OrderSide, OrderStatus};
pub use position::{stock_ratio, AccountState, Balance, NetPositionView, Position, PositionSide};
pub use sink::{MetricsSink, NoopSink};
