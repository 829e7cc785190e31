//! Order sizing.

use rust_decimal::Decimal;

use skew_core::{InstrumentSpec, Price, Size};

/// Amount for each desired order.
///
/// `equity / basis * ratio`, raised to the instrument minimum and to the
/// minimum notional, then rounded up to the amount step. Missing or
/// non-positive equity or ratio fall back to the instrument minimum; the
/// notional floor still applies whenever the basis is positive.
pub fn compute_order_amount(
    equity: Decimal,
    basis: Price,
    ratio: Decimal,
    instrument: &InstrumentSpec,
    min_order_notional: Decimal,
) -> Size {
    let min_amount = instrument.min_amount.inner();
    if !basis.is_positive() {
        return Size::new(min_amount).ceil_to_step(instrument.amount_step);
    }

    let mut amount = if equity > Decimal::ZERO && ratio > Decimal::ZERO {
        (equity / basis.inner() * ratio).max(min_amount)
    } else {
        min_amount
    };
    if min_order_notional > Decimal::ZERO {
        amount = amount.max(min_order_notional / basis.inner());
    }
    Size::new(amount).ceil_to_step(instrument.amount_step)
}
