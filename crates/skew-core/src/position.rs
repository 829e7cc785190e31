//! Positions, account balances and the inventory ratios derived from them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decimal::Size;

/// Hedge-mode position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Contracts held (always non-negative).
    pub size: Size,
    /// Margin committed to this position, in the settlement coin.
    pub margin: Decimal,
}

/// Net exposure for one symbol, recomputed from every position update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetPositionView {
    pub net_position: Decimal,
    pub long_size: Decimal,
    pub short_size: Decimal,
    pub long_margin: Decimal,
    pub short_margin: Decimal,
}

impl NetPositionView {
    /// Aggregate positions for `symbol`, ignoring other symbols.
    pub fn from_positions(symbol: &str, positions: &[Position]) -> Self {
        let mut view = Self::default();
        for position in positions.iter().filter(|p| p.symbol == symbol) {
            let size = position.size.inner().abs();
            let margin = position.margin.max(Decimal::ZERO);
            match position.side {
                PositionSide::Long => {
                    view.long_size += size;
                    view.long_margin += margin;
                }
                PositionSide::Short => {
                    view.short_size += size;
                    view.short_margin += margin;
                }
            }
        }
        view.net_position = view.long_size - view.short_size;
        view
    }

    pub fn is_flat(&self) -> bool {
        self.long_size.is_zero() && self.short_size.is_zero()
    }

    /// Long margin exposure: `long_margin / (balance + long_margin)`.
    pub fn long_ratio(&self, balance: Decimal) -> Decimal {
        stock_ratio(self.long_margin, balance)
    }

    /// Short margin exposure: `short_margin / (balance + short_margin)`.
    pub fn short_ratio(&self, balance: Decimal) -> Decimal {
        stock_ratio(self.short_margin, balance)
    }

    /// Signed exposure: positive when long margin dominates.
    ///
    /// `(long_margin - short_margin) / (balance + long_margin + short_margin)`,
    /// zero when the denominator is not positive.
    pub fn net_ratio(&self, balance: Decimal) -> Decimal {
        let denominator = balance + self.long_margin + self.short_margin;
        if denominator <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.long_margin - self.short_margin) / denominator
    }
}

/// Margin exposure ratio `margin / (balance + margin)`.
///
/// Returns zero when the denominator is not positive; never negative.
pub fn stock_ratio(margin: Decimal, balance: Decimal) -> Decimal {
    let denominator = balance + margin;
    if denominator <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (margin / denominator).max(Decimal::ZERO)
}

/// Balance for one asset as reported by the exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub total: Decimal,
}

/// Account figures used by sizing and inventory math.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Free balance in the settlement coin.
    pub balance: Decimal,
    /// Total equity; clamped at zero.
    pub equity: Decimal,
}

impl From<Balance> for AccountState {
    fn from(b: Balance) -> Self {
        Self {
            balance: b.free,
            equity: b.total.max(Decimal::ZERO),
        }
    }
}
