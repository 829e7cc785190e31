//! Paper-trading market maker.
//!
//! Loads the TOML configuration, starts one `InstrumentEngine` per enabled
//! instrument against a `SimulatedGateway` driven by a price oscillator,
//! and supervises the engines until Ctrl-C.

pub mod app;
pub mod config;
pub mod error;

pub use app::{Application, PriceOscillator};
pub use config::{AppConfig, InstrumentConfig, SimulationConfig, TelemetryConfig};
pub use error::{AppError, AppResult};
