//! Classification of open orders into protective stops and take-profit targets.
//!
//! The stop-replacement protocol only ever cancels [`OrderClass::Protective`]
//! orders. Anything ambiguous falls into [`OrderClass::Other`] and is left alone.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::events::Order;
use crate::position::Side;

const TAKE_PROFIT_MARKER: &str = "TAKE_PROFIT";
const STOP_MARKER: &str = "STOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderClass {
    /// Reduce-only stop guarding the position.
    Protective,
    /// Take-profit order. Never touched by the stop protocol.
    Target,
    Other,
}

/// Classifies from the raw fields, so callers can classify before building an [`Order`].
#[must_use]
pub fn classify_parts(
    order_type: &str,
    trigger_price: Option<Decimal>,
    reduce_only: bool,
    close_position: bool,
) -> OrderClass {
    let upper = order_type.to_ascii_uppercase();
    if upper.contains(TAKE_PROFIT_MARKER) {
        return OrderClass::Target;
    }
    let has_trigger = trigger_price.is_some_and(|p| p > Decimal::ZERO);
    if upper.contains(STOP_MARKER) && has_trigger && (reduce_only || close_position) {
        OrderClass::Protective
    } else {
        OrderClass::Other
    }
}

#[must_use]
pub fn classify(order: &Order) -> OrderClass {
    classify_parts(
        &order.order_type,
        order.trigger_price,
        order.reduce_only,
        order.close_position,
    )
}

#[must_use]
pub fn is_protective(order: &Order) -> bool {
    classify(order) == OrderClass::Protective
}

#[must_use]
pub fn is_target(order: &Order) -> bool {
    classify(order) == OrderClass::Target
}

/// Protective orders among `orders`, in input order.
pub fn protective_orders(orders: &[Order]) -> impl Iterator<Item = &Order> {
    orders.iter().filter(|o| is_protective(o))
}

/// Tightest protective trigger for a position on `side`: the highest stop for a
/// long, the lowest for a short.
#[must_use]
pub fn current_stop_price(orders: &[Order], side: Side) -> Option<Decimal> {
    let triggers = protective_orders(orders).filter_map(|o| o.trigger_price);
    match side {
        Side::Long => triggers.max(),
        Side::Short => triggers.min(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderSide;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn order(order_type: &str, trigger: Option<Decimal>, reduce_only: bool) -> Order {
        Order {
            order_id: "1".into(),
            symbol: "BTCUSDT".into(),
            order_type: order_type.into(),
            side: OrderSide::Sell,
            quantity: dec!(1),
            trigger_price: trigger,
            reduce_only,
            close_position: false,
        }
    }

    #[test]
    fn test_stop_market_reduce_only_is_protective() {
        assert_eq!(
            classify(&order("STOP_MARKET", Some(dec!(90)), true)),
            OrderClass::Protective
        );
        assert_eq!(
            classify(&order("stop", Some(dec!(90)), true)),
            OrderClass::Protective
        );
    }

    #[test]
    fn test_take_profit_with_trigger_is_target() {
        for ty in ["TAKE_PROFIT", "TAKE_PROFIT_MARKET", "TAKE_PROFIT_LIMIT", "take_profit_stop"] {
            assert_eq!(classify(&order(ty, Some(dec!(110)), true)), OrderClass::Target, "{ty}");
        }
    }

    #[test]
    fn test_ambiguous_orders_are_other() {
        assert_eq!(classify(&order("STOP_MARKET", None, true)), OrderClass::Other);
        assert_eq!(classify(&order("STOP_MARKET", Some(dec!(90)), false)), OrderClass::Other);
        assert_eq!(classify(&order("STOP_MARKET", Some(dec!(0)), true)), OrderClass::Other);
        assert_eq!(classify(&order("LIMIT", Some(dec!(90)), true)), OrderClass::Other);
    }

    #[test]
    fn test_close_position_flag_counts_as_reduce_only() {
        let mut o = order("STOP_MARKET", Some(dec!(90)), false);
        o.close_position = true;
        assert!(is_protective(&o));
    }

    #[test]
    fn test_current_stop_picks_tightest() {
        let orders = vec![
            order("STOP_MARKET", Some(dec!(90)), true),
            order("STOP_MARKET", Some(dec!(95)), true),
            order("TAKE_PROFIT_MARKET", Some(dec!(120)), true),
        ];
        assert_eq!(current_stop_price(&orders, Side::Long), Some(dec!(95)));
        assert_eq!(current_stop_price(&orders, Side::Short), Some(dec!(90)));
        assert_eq!(current_stop_price(&[], Side::Long), None);
    }

    fn type_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("STOP".to_string()),
            Just("STOP_MARKET".to_string()),
            Just("TAKE_PROFIT".to_string()),
            Just("TAKE_PROFIT_MARKET".to_string()),
            Just("TAKE_PROFIT_LIMIT".to_string()),
            Just("LIMIT".to_string()),
            Just("MARKET".to_string()),
            Just("TRAILING_STOP_MARKET".to_string()),
            "[A-Za-z_]{0,24}",
        ]
    }

    proptest! {
        #[test]
        fn prop_take_profit_never_protective(
            ty in type_strategy(),
            prefix in "[a-z_]{0,4}",
            trigger in proptest::option::of(0i64..1_000_000),
            reduce_only in any::<bool>(),
            close_position in any::<bool>(),
        ) {
            let trigger = trigger.map(|t| Decimal::new(t, 2));
            let class = classify_parts(&format!("{prefix}{ty}"), trigger, reduce_only, close_position);
            if format!("{prefix}{ty}").to_ascii_uppercase().contains("TAKE_PROFIT") {
                prop_assert_eq!(class, OrderClass::Target);
            }
            if class == OrderClass::Protective {
                prop_assert!(trigger.is_some());
                prop_assert!(reduce_only || close_position);
            }
        }
    }
}
