//! Price and size newtypes over `rust_decimal::Decimal`.
//!
//! Quote prices, order amounts and tick keys are all derived from these, so
//! grid alignment and planner keys compare exactly.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Quote or order price in the quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round down to a multiple of `tick_size` (bids).
    #[inline]
    pub fn floor_to_tick(&self, tick_size: Price) -> Self {
        if !tick_size.is_positive() {
            return *self;
        }
        Self((self.0 / tick_size.0).floor() * tick_size.0)
    }

    /// Round up to a multiple of `tick_size` (asks).
    #[inline]
    pub fn ceil_to_tick(&self, tick_size: Price) -> Self {
        if !tick_size.is_positive() {
            return *self;
        }
        Self((self.0 / tick_size.0).ceil() * tick_size.0)
    }

    /// Absolute distance to `other` as a fraction of `reference`.
    #[inline]
    pub fn deviation_from(&self, other: Price, reference: Price) -> Option<Decimal> {
        if !reference.is_positive() {
            return None;
        }
        Some((self.0 - other.0).abs() / reference.0)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul<Decimal> for Price {
    type Output = Self;

    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Div<Decimal> for Price {
    type Output = Self;

    fn div(self, rhs: Decimal) -> Self::Output {
        Self(self.0 / rhs)
    }
}

/// Order amount in base-currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round up to a multiple of `step`.
    #[inline]
    pub fn ceil_to_step(&self, step: Size) -> Self {
        if !step.is_positive() {
            return *self;
        }
        Self((self.0 / step.0).ceil() * step.0)
    }

    /// Notional value: size * price.
    #[inline]
    pub fn notional(&self, price: Price) -> Decimal {
        self.0 * price.0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Size {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Size {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Size {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Integer-quantized price used as a stable diffing key.
///
/// `round(price / tick_size)`, half away from zero. The same price and
/// tick size always produce the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTick(pub i64);

impl PriceTick {
    pub fn from_price(price: Price, tick_size: Price) -> Result<Self> {
        if !tick_size.is_positive() {
            return Err(CoreError::InvalidTickSize(tick_size.to_string()));
        }
        let ticks = price
            .0
            .checked_div(tick_size.0)
            .ok_or_else(|| CoreError::InvalidPrice(format!("{price} overflows tick index")))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        ticks
            .to_i64()
            .map(Self)
            .ok_or_else(|| CoreError::InvalidPrice(format!("{price} overflows tick index")))
    }

    /// Price at the center of this tick.
    pub fn to_price(self, tick_size: Price) -> Price {
        Price(Decimal::from(self.0) * tick_size.0)
    }
}

impl fmt::Display for PriceTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_floor_and_ceil_to_tick() {
        let quote = Price::new(dec!(99.9173));
        let tick = Price::new(dec!(0.05));

        assert_eq!(quote.floor_to_tick(tick).0, dec!(99.90));
        assert_eq!(quote.ceil_to_tick(tick).0, dec!(99.95));
    }

    #[test]
    fn test_price_tick_deterministic() {
        let tick = Price::new(dec!(0.5));
        let p = Price::new(dec!(100.26));

        let a = PriceTick::from_price(p, tick).unwrap();
        let b = PriceTick::from_price(p, tick).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, PriceTick(201));
    }

    #[test]
    fn test_price_tick_midpoint_rounds_away_from_zero() {
        let tick = Price::new(dec!(1));
        assert_eq!(
            PriceTick::from_price(Price::new(dec!(2.5)), tick).unwrap(),
            PriceTick(3)
        );
        assert_eq!(
            PriceTick::from_price(Price::new(dec!(3.5)), tick).unwrap(),
            PriceTick(4)
        );
    }

    #[test]
    fn test_price_tick_rejects_zero_tick() {
        let result = PriceTick::from_price(Price::new(dec!(100)), Price::ZERO);
        assert!(matches!(result, Err(CoreError::InvalidTickSize(_))));
    }

    #[test]
    fn test_price_tick_overflow_is_error() {
        let result = PriceTick::from_price(Price::new(Decimal::MAX), Price::new(dec!(0.0000001)));
        assert!(matches!(result, Err(CoreError::InvalidPrice(_))));
    }

    #[test]
    fn test_size_ceil_to_step() {
        let size = Size::new(dec!(1.2341));
        assert_eq!(size.ceil_to_step(Size::new(dec!(0.001))).0, dec!(1.235));
        assert_eq!(size.ceil_to_step(Size::ZERO), size);
    }

    #[test]
    fn test_deviation_from() {
        let order = Price::new(dec!(99.4));
        let target = Price::new(dec!(99.5));
        let basis = Price::new(dec!(100));

        assert_eq!(order.deviation_from(target, basis), Some(dec!(0.001)));
        assert_eq!(order.deviation_from(target, Price::ZERO), None);
    }

    #[test]
    fn test_order_notional() {
        let amount = Size::new(dec!(0.055));
        assert_eq!(amount.notional(Price::new(dec!(100))), dec!(5.5));
    }
}
