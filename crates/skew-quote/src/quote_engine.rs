//! Quote price calculation engine.
//!
//! Computes buy/sell spreads and prices from:
//! - Basis price (mid, last, or last fill)
//! - Inventory exposure normalized by `max_stock_ratio`
//! - Optional volatility factor, gated by `SpreadMode`
//!
//! Spread follows a piecewise-linear curve with its balance point at 0.5:
//!
//! ```text
//! ratio    0.0 ────────── 0.5 ────────── 1.0
//! widen    min ────────── base ───────── max
//! narrow   max ────────── base ───────── min
//! ```
//!
//! In `long` mode the buy side widens and the sell side narrows as long
//! inventory grows; `short` mirrors that. In `both` mode the signed net
//! ratio drives the buy side when positive and the sell side when
//! negative, so both sides sit at `min` when flat.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use skew_core::{DirectionMode, OrderSide, Price};

use crate::config::{QuoteConfig, SpreadMode};
use crate::inventory::InventoryExposure;

const BALANCE_POINT: Decimal = dec!(0.5);

/// Spread curve anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadBounds {
    pub min: Decimal,
    pub base: Decimal,
    pub max: Decimal,
}

impl SpreadBounds {
    pub fn from_config(config: &QuoteConfig) -> Self {
        Self {
            min: config.min_spread,
            base: config.base_spread,
            max: config.max_spread,
        }
    }

    /// Spread on the accumulating side: min at 0, base at 0.5, max at 1.
    pub fn widening(&self, ratio: Decimal) -> Decimal {
        let x = ratio.clamp(Decimal::ZERO, Decimal::ONE);
        let spread = if x < BALANCE_POINT {
            self.min + (self.base - self.min) * (x / BALANCE_POINT)
        } else {
            self.base + (self.max - self.base) * ((x - BALANCE_POINT) / BALANCE_POINT)
        };
        self.clamp(spread)
    }

    /// Spread on the reducing side: max at 0, base at 0.5, min at 1.
    pub fn narrowing(&self, ratio: Decimal) -> Decimal {
        self.widening(Decimal::ONE - ratio.clamp(Decimal::ZERO, Decimal::ONE))
    }

    fn clamp(&self, spread: Decimal) -> Decimal {
        spread.max(self.min).min(self.max)
    }

    /// Every anchor multiplied by `factor`, then kept inside `[floor, cap]`.
    fn scaled(&self, factor: Decimal, floor: Decimal, cap: Decimal) -> Self {
        let scale = |s: Decimal| (s * factor).max(floor).min(cap);
        Self {
            min: scale(self.min),
            base: scale(self.base),
            max: scale(self.max),
        }
    }

    /// Linear interpolation toward `other` by `weight` in `[0, 1]`.
    fn blend(&self, other: &Self, weight: Decimal) -> Self {
        let w = weight.clamp(Decimal::ZERO, Decimal::ONE);
        let lerp = |a: Decimal, b: Decimal| a + (b - a) * w;
        Self {
            min: lerp(self.min, other.min),
            base: lerp(self.base, other.base),
            max: lerp(self.max, other.max),
        }
    }
}

/// Computed quote for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub buy_spread: Decimal,
    pub sell_spread: Decimal,
    pub buy_price: Price,
    pub sell_price: Price,
    pub basis_price: Price,
}

impl Quote {
    /// Target price for an order side.
    pub fn price_for(&self, side: OrderSide) -> Price {
        match side {
            OrderSide::Buy => self.buy_price,
            OrderSide::Sell => self.sell_price,
        }
    }
}

/// Map a volatility estimate to a multiplicative spread factor.
///
/// `1 + volatility * sensitivity`, clamped to `[factor_floor, factor_cap]`.
pub fn volatility_factor(volatility: Decimal, config: &QuoteConfig) -> Decimal {
    (Decimal::ONE + volatility * config.volatility_sensitivity)
        .max(config.factor_floor)
        .min(config.factor_cap)
}

/// Spread anchors after applying the configured spread mode.
///
/// `exposure` is the magnitude of the normalized inventory ratio; it only
/// matters in hybrid mode. Without a volatility factor every mode falls
/// back to the fixed bounds.
pub fn effective_bounds(
    config: &QuoteConfig,
    volatility_factor: Option<Decimal>,
    exposure: Decimal,
) -> SpreadBounds {
    let fixed = SpreadBounds::from_config(config);
    let Some(factor) = volatility_factor else {
        return fixed;
    };
    let dynamic = fixed.scaled(factor, config.allowed_min_spread, config.allowed_max_spread);

    match config.spread_mode {
        SpreadMode::Fixed => fixed,
        SpreadMode::Dynamic => dynamic,
        SpreadMode::Hybrid => {
            let x = exposure.abs();
            if x <= config.inventory_safe_threshold {
                fixed
            } else if x >= config.inventory_risk_threshold {
                dynamic
            } else {
                let weight = (x - config.inventory_safe_threshold)
                    / (config.inventory_risk_threshold - config.inventory_safe_threshold);
                fixed.blend(&dynamic, weight)
            }
        }
    }
}

/// Buy and sell spreads for the given direction mode and normalized ratio.
///
/// `ratio` is in `[0, 1]` for `long`/`short` and signed in `[-1, 1]` for `both`.
pub fn compute_spreads(
    bounds: &SpreadBounds,
    mode: DirectionMode,
    ratio: Decimal,
) -> (Decimal, Decimal) {
    match mode {
        DirectionMode::Long => (bounds.widening(ratio), bounds.narrowing(ratio)),
        DirectionMode::Short => (bounds.narrowing(ratio), bounds.widening(ratio)),
        DirectionMode::Both => {
            let long_side = ratio.max(Decimal::ZERO);
            let short_side = (-ratio).max(Decimal::ZERO);
            (bounds.widening(long_side), bounds.widening(short_side))
        }
    }
}

/// Compute a quote around `basis_price`.
///
/// Pure function of its inputs; no I/O.
pub fn compute_quote(
    config: &QuoteConfig,
    mode: DirectionMode,
    exposure: &InventoryExposure,
    basis_price: Price,
    volatility_factor: Option<Decimal>,
) -> Quote {
    let ratio = exposure.normalized(mode, config.max_stock_ratio);
    let bounds = effective_bounds(config, volatility_factor, ratio);
    let (buy_spread, sell_spread) = compute_spreads(&bounds, mode, ratio);

    Quote {
        buy_spread,
        sell_spread,
        buy_price: basis_price * (Decimal::ONE - buy_spread),
        sell_price: basis_price * (Decimal::ONE + sell_spread),
        basis_price,
    }
}
