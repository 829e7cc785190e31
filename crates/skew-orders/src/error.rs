//! Gateway and engine error types.
//!
//! Every gateway failure is classified at the boundary so recovery
//! routing can match on it exhaustively.

use thiserror::Error;

use skew_quote::QuoteError;

/// Failure reported by an exchange gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Transient connectivity problem or timeout; safe to retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Request rejected by the exchange (bad size, unknown order, ...).
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Gateway error: {0}")]
    Other(String),
}

impl GatewayError {
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Exchange(_) => "exchange",
            Self::Other(_) => "other",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Engine-level failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Some operations of a concurrent batch failed.
    #[error("Partial failure: {failed} of {total} operations failed")]
    PartialFailure { failed: usize, total: usize },

    /// Misconfiguration detected before trading starts.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The engine is shutting down and the operation was dropped.
    #[error("Engine stopped")]
    Stopped,
}

impl EngineError {
    /// Whether this failure should route to recovery.
    ///
    /// Network and partial failures are recoverable, as is anything the
    /// gateway could not classify. Exchange rejections abandon only the
    /// failing operation.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Gateway(GatewayError::Network(_)) => true,
            Self::Gateway(GatewayError::Other(_)) => true,
            Self::Gateway(GatewayError::Exchange(_)) => false,
            Self::PartialFailure { .. } => true,
            Self::Validation(_) | Self::Stopped => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.kind(),
            Self::PartialFailure { .. } => "partial",
            Self::Validation(_) => "validation",
            Self::Stopped => "stopped",
        }
    }
}

impl From<QuoteError> for EngineError {
    fn from(e: QuoteError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<skew_core::CoreError> for EngineError {
    fn from(e: skew_core::CoreError) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
