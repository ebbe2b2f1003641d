//! Exchange instrument filters: lot step, price tick, minimum size.

use riskgate_core::{InstrumentRules, Side};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SizingRejection {
    #[error("quantity {quantity} below minimum {min_qty}")]
    BelowMinQty { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} below minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("non-positive {field}: {value}")]
    NonPositive { field: &'static str, value: Decimal },
}

/// Largest multiple of `step` not above `quantity`.
#[must_use]
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).floor() * step).normalize()
}

/// Rounds a stop trigger to the tick grid, never loosening it: a long's stop
/// rounds up, a short's rounds down.
#[must_use]
pub fn round_stop_to_tick(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let rounded = match side {
        Side::Long => steps.round_dp_with_strategy(0, RoundingStrategy::ToPositiveInfinity),
        Side::Short => steps.round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity),
    };
    (rounded * tick).normalize()
}

/// Floors `quantity` to the lot step and checks it against the minimums.
///
/// Never rounds up: an order too small for the exchange is rejected rather than
/// enlarged past its risk budget.
///
/// # Errors
/// Returns a [`SizingRejection`] when the floored size is unusable.
pub fn normalize_quantity(
    quantity: Decimal,
    price: Decimal,
    rules: &InstrumentRules,
) -> Result<Decimal, SizingRejection> {
    if price <= Decimal::ZERO {
        return Err(SizingRejection::NonPositive {
            field: "price",
            value: price,
        });
    }
    let floored = floor_to_step(quantity, rules.step_size);
    if floored <= Decimal::ZERO || floored < rules.min_qty {
        return Err(SizingRejection::BelowMinQty {
            quantity: floored,
            min_qty: rules.min_qty,
        });
    }
    let notional = floored * price;
    if notional < rules.min_notional {
        return Err(SizingRejection::BelowMinNotional {
            notional,
            min_notional: rules.min_notional,
        });
    }
    Ok(floored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn rules() -> InstrumentRules {
        InstrumentRules {
            min_qty: dec!(0.001),
            step_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(1.23456), dec!(0.001)), dec!(1.234));
        assert_eq!(floor_to_step(dec!(7), dec!(5)), dec!(5));
        assert_eq!(floor_to_step(dec!(7), dec!(0)), dec!(7));
    }

    #[test]
    fn test_stop_rounding_never_loosens() {
        assert_eq!(round_stop_to_tick(dec!(99.96), dec!(0.1), Side::Long), dec!(100));
        assert_eq!(round_stop_to_tick(dec!(100.04), dec!(0.1), Side::Short), dec!(100));
        assert_eq!(round_stop_to_tick(dec!(100.0), dec!(0.1), Side::Long), dec!(100));
    }

    #[test]
    fn test_normalize_rejects_small_orders() {
        assert_eq!(
            normalize_quantity(dec!(0.0009), dec!(60000), &rules()),
            Err(SizingRejection::BelowMinQty {
                quantity: dec!(0),
                min_qty: dec!(0.001)
            })
        );
        assert!(matches!(
            normalize_quantity(dec!(0.004), dec!(1000), &rules()),
            Err(SizingRejection::BelowMinNotional { .. })
        ));
        assert_eq!(normalize_quantity(dec!(0.0109), dec!(1000), &rules()), Ok(dec!(0.01)));
    }

    proptest! {
        #[test]
        fn prop_normalized_quantity_never_exceeds_request(
            qty in 1i64..10_000_000,
            price in 1i64..10_000_000,
        ) {
            let qty = Decimal::new(qty, 4);
            let price = Decimal::new(price, 2);
            if let Ok(n) = normalize_quantity(qty, price, &rules()) {
                prop_assert!(n <= qty);
                prop_assert!(n * price >= dec!(5));
            }
        }

        #[test]
        fn prop_long_stop_never_below_request(price in 1i64..100_000_000) {
            let price = Decimal::new(price, 3);
            prop_assert!(round_stop_to_tick(price, dec!(0.1), Side::Long) >= price);
            prop_assert!(round_stop_to_tick(price, dec!(0.1), Side::Short) <= price);
        }
    }
}
