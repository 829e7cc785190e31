//! Quote error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuoteError {
    #[error("Invalid quote configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid volatility configuration: {0}")]
    InvalidVolatilityConfig(String),
}

pub type QuoteResult<T> = Result<T, QuoteError>;
