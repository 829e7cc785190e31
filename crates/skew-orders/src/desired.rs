//! Desired order set and live-order matching.

use std::collections::HashMap;

use rust_decimal::Decimal;

use skew_core::{DirectionMode, Order, OrderIntent, OrderSide, Price};
use skew_quote::Quote;

/// Order roles to keep resting for the current mode and exposure.
///
/// Opening roles are always present; a closing role appears only when the
/// matching position exists. `both` orders them open-long, close-short,
/// open-short, close-long.
pub fn compute_desired_orders(
    mode: DirectionMode,
    long_size: Decimal,
    short_size: Decimal,
) -> Vec<OrderIntent> {
    let has_long = long_size > Decimal::ZERO;
    let has_short = short_size > Decimal::ZERO;

    let mut desired = Vec::with_capacity(4);
    match mode {
        DirectionMode::Long => {
            desired.push(OrderIntent::OPEN_LONG);
            if has_long {
                desired.push(OrderIntent::CLOSE_LONG);
            }
        }
        DirectionMode::Short => {
            desired.push(OrderIntent::OPEN_SHORT);
            if has_short {
                desired.push(OrderIntent::CLOSE_SHORT);
            }
        }
        DirectionMode::Both => {
            desired.push(OrderIntent::OPEN_LONG);
            if has_short {
                desired.push(OrderIntent::CLOSE_SHORT);
            }
            desired.push(OrderIntent::OPEN_SHORT);
            if has_long {
                desired.push(OrderIntent::CLOSE_LONG);
            }
        }
    }
    desired
}

/// Why a live order set does or does not match the desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    /// Per-class counts differ.
    CountMismatch {
        side: OrderSide,
        reduce_only: bool,
        live: usize,
        desired: usize,
    },
    /// An order drifted too far from its quote price.
    Drifted {
        side: OrderSide,
        price: Price,
        target: Price,
        deviation: Decimal,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Compare live orders against the desired roles and quote.
///
/// Counts per `(side, reduce_only)` must be equal and every live order must
/// sit within `tolerance` of its side's quote price, measured relative to
/// the basis price.
pub fn check_orders(
    live: &[Order],
    desired: &[OrderIntent],
    quote: &Quote,
    tolerance: Decimal,
) -> MatchOutcome {
    let mut counts: HashMap<(OrderSide, bool), (usize, usize)> = HashMap::new();
    for order in live {
        counts.entry((order.side, order.reduce_only)).or_default().0 += 1;
    }
    for intent in desired {
        counts.entry(intent.class()).or_default().1 += 1;
    }

    // Deterministic reporting order.
    let mut classes: Vec<_> = counts.into_iter().collect();
    classes.sort_by_key(|((side, reduce_only), _)| (*side == OrderSide::Sell, *reduce_only));
    if let Some(((side, reduce_only), (live, desired))) =
        classes.into_iter().find(|(_, (l, d))| l != d)
    {
        return MatchOutcome::CountMismatch {
            side,
            reduce_only,
            live,
            desired,
        };
    }

    for order in live {
        let target = quote.price_for(order.side);
        let Some(deviation) = order.price.deviation_from(target, quote.basis_price) else {
            return MatchOutcome::Drifted {
                side: order.side,
                price: order.price,
                target,
                deviation: Decimal::MAX,
            };
        };
        if deviation > tolerance {
            return MatchOutcome::Drifted {
                side: order.side,
                price: order.price,
                target,
                deviation,
            };
        }
    }
    MatchOutcome::Match
}

pub fn orders_match_desired(
    live: &[Order],
    desired: &[OrderIntent],
    quote: &Quote,
    tolerance: Decimal,
) -> bool {
    check_orders(live, desired, quote, tolerance).is_match()
}
