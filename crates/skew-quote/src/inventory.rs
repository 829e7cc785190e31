//! Inventory exposure as seen by the quote engine.
//!
//! Converts a position view and account balance into the stock ratios
//! that skew spreads, and normalizes them by `max_stock_ratio` for the
//! active direction mode.

use rust_decimal::Decimal;

use skew_core::{AccountState, DirectionMode, NetPositionView};

/// Raw stock ratios for one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryExposure {
    /// `long_margin / (balance + long_margin)`.
    pub long_ratio: Decimal,
    /// `short_margin / (balance + short_margin)`.
    pub short_ratio: Decimal,
    /// Signed net margin ratio; positive when long dominates.
    pub net_ratio: Decimal,
}

impl InventoryExposure {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn from_view(view: &NetPositionView, account: &AccountState) -> Self {
        Self {
            long_ratio: view.long_ratio(account.balance),
            short_ratio: view.short_ratio(account.balance),
            net_ratio: view.net_ratio(account.balance),
        }
    }

    /// Ratio relative to `max_stock_ratio`.
    ///
    /// `long`/`short` modes return the accumulating side's ratio in `[0, 1]`.
    /// `both` returns the signed net ratio in `[-1, 1]`.
    pub fn normalized(&self, mode: DirectionMode, max_stock_ratio: Decimal) -> Decimal {
        if max_stock_ratio <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        match mode {
            DirectionMode::Long => {
                (self.long_ratio / max_stock_ratio).clamp(Decimal::ZERO, Decimal::ONE)
            }
            DirectionMode::Short => {
                (self.short_ratio / max_stock_ratio).clamp(Decimal::ZERO, Decimal::ONE)
            }
            DirectionMode::Both => {
                (self.net_ratio / max_stock_ratio).clamp(Decimal::NEGATIVE_ONE, Decimal::ONE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use skew_core::{Position, PositionSide, Size};

    fn view_with(side: PositionSide, margin: Decimal) -> NetPositionView {
        NetPositionView::from_positions(
            "BTC/USDT",
            &[Position {
                symbol: "BTC/USDT".to_string(),
                side,
                size: Size::new(dec!(1)),
                margin,
            }],
        )
    }

    #[test]
    fn test_flat_is_zero_everywhere() {
        let exposure = InventoryExposure::flat();
        for mode in [DirectionMode::Long, DirectionMode::Short, DirectionMode::Both] {
            assert_eq!(exposure.normalized(mode, dec!(0.25)), Decimal::ZERO);
        }
    }

    #[test]
    fn test_long_exposure_normalized() {
        let account = AccountState {
            balance: dec!(90),
            equity: dec!(100),
        };
        let view = view_with(PositionSide::Long, dec!(10));
        let exposure = InventoryExposure::from_view(&view, &account);

        assert_eq!(exposure.long_ratio, dec!(0.1));
        assert_eq!(exposure.normalized(DirectionMode::Long, dec!(0.2)), dec!(0.5));
        assert_eq!(exposure.normalized(DirectionMode::Short, dec!(0.2)), dec!(0));
    }

    #[test]
    fn test_short_exposure_is_negative_in_both_mode() {
        let account = AccountState {
            balance: dec!(90),
            equity: dec!(100),
        };
        let view = view_with(PositionSide::Short, dec!(10));
        let exposure = InventoryExposure::from_view(&view, &account);

        assert_eq!(exposure.normalized(DirectionMode::Both, dec!(0.25)), dec!(-0.4));
    }

    #[test]
    fn test_normalized_is_clamped() {
        let exposure = InventoryExposure {
            long_ratio: dec!(0.9),
            short_ratio: dec!(0),
            net_ratio: dec!(0.9),
        };
        assert_eq!(exposure.normalized(DirectionMode::Long, dec!(0.25)), dec!(1));
        assert_eq!(exposure.normalized(DirectionMode::Both, dec!(0.25)), dec!(1));
    }
}
