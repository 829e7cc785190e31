//! Orders as the engine sees them: requests, live orders and their roles.
//!
//! Provides order side, status, identifiers, the mirrored exchange
//! `Order`, the `OrderRequest` submitted to a gateway, and the
//! `OrderIntent` roles the reconciler derives from exposure.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::decimal::{Price, Size};
use crate::position::PositionSide;

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    #[serde(alias = "closed")]
    Filled,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl OrderStatus {
    /// Whether the order can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Filled => write!(f, "filled"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique id with the given prefix.
    ///
    /// Format: `{prefix}_{timestamp_ms}_{uuid_short}`
    pub fn generate(prefix: &str) -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("{prefix}_{ts}_{uuid_short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Order as mirrored from the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Price,
    pub amount: Size,
    /// Filled amount; zero when unknown.
    #[serde(default = "default_filled")]
    pub filled: Size,
    #[serde(default)]
    pub reduce_only: bool,
    pub status: OrderStatus,
}

fn default_filled() -> Size {
    Size::ZERO
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }
}

/// Limit order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Price,
    pub amount: Size,
    pub reduce_only: bool,
}

/// Whether an intent opens or closes exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderRole {
    Open,
    Close,
}

/// One desired order role derived from direction mode and exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub reduce_only: bool,
    pub role: OrderRole,
    pub position_side: PositionSide,
}

impl OrderIntent {
    pub const OPEN_LONG: Self = Self {
        side: OrderSide::Buy,
        reduce_only: false,
        role: OrderRole::Open,
        position_side: PositionSide::Long,
    };

    pub const CLOSE_LONG: Self = Self {
        side: OrderSide::Sell,
        reduce_only: true,
        role: OrderRole::Close,
        position_side: PositionSide::Long,
    };

    pub const OPEN_SHORT: Self = Self {
        side: OrderSide::Sell,
        reduce_only: false,
        role: OrderRole::Open,
        position_side: PositionSide::Short,
    };

    pub const CLOSE_SHORT: Self = Self {
        side: OrderSide::Buy,
        reduce_only: true,
        role: OrderRole::Close,
        position_side: PositionSide::Short,
    };

    /// Matching class for count comparisons.
    pub fn class(&self) -> (OrderSide, bool) {
        (self.side, self.reduce_only)
    }

    pub fn label(&self) -> &'static str {
        match (self.role, self.position_side) {
            (OrderRole::Open, PositionSide::Long) => "open-long",
            (OrderRole::Close, PositionSide::Long) => "close-long",
            (OrderRole::Open, PositionSide::Short) => "open-short",
            (OrderRole::Close, PositionSide::Short) => "close-short",
        }
    }
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
