//! Atomic stop-loss replacement.
//!
//! The only code path allowed to change a protective stop. The new stop is
//! placed and confirmed before any old stop is cancelled, so at every instant
//! either the old or the new stop is live. Take-profit orders are never
//! candidates for cancellation here.

use chrono::Utc;
use riskgate_core::config::StopReplaceConfig;
use riskgate_core::order_class::{classify, OrderClass};
use riskgate_core::{
    retry_call, ExchangeGateway, GatewayError, Order, OrderRequest, RetryPolicy, Side,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::filters::{floor_to_step, round_stop_to_tick, SizingRejection};
use crate::state_store::StateStore;
use crate::symbol_locks::{SymbolGuard, SymbolLocks};

#[derive(Debug, Error)]
pub enum StopReplaceError {
    /// Gateway reports no position. Leftover stops were cancelled instead.
    #[error("position is flat ({} leftover stops cancelled)", cleaned.len())]
    Flat { cleaned: Vec<String> },

    /// The new stop never showed up in open orders; the old stop was kept.
    #[error("new stop {order_id} not confirmed after {attempts} polls")]
    NotConfirmed { order_id: String, attempts: u32 },

    #[error("stop size rejected: {0}")]
    Sizing(#[from] SizingRejection),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl StopReplaceError {
    /// Placement failures that count toward the execution-failure circuit breaker.
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::NotConfirmed { .. })
    }
}

/// Result of a completed replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReplacement {
    pub symbol: String,
    pub order_id: String,
    pub side: Side,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    /// Old stops cancelled after confirmation.
    pub cancelled: Vec<String>,
    /// Old stops whose cancel failed; duplicates left live on the exchange.
    pub zombies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
}

pub struct StopReplacer {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<StateStore>,
    locks: Arc<SymbolLocks>,
    config: StopReplaceConfig,
    retry: RetryPolicy,
}

impl StopReplacer {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<StateStore>,
        locks: Arc<SymbolLocks>,
        config: StopReplaceConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            locks,
            config,
            retry,
        }
    }

    /// Replaces the protective stop of `symbol` with one at `desired_price`.
    ///
    /// Takes the symbol's mutation lock for the whole call.
    ///
    /// # Errors
    /// Any error leaves the previously working stop in place.
    pub async fn replace_stop(
        &self,
        symbol: &str,
        direction: Side,
        desired_price: Decimal,
    ) -> Result<StopReplacement, StopReplaceError> {
        let guard = self.locks.lock(symbol).await;
        self.replace_stop_locked(&guard, direction, desired_price).await
    }

    /// Same as [`Self::replace_stop`] for a caller already holding the lock.
    ///
    /// # Errors
    /// Any error leaves the previously working stop in place.
    pub async fn replace_stop_locked(
        &self,
        guard: &SymbolGuard,
        direction: Side,
        desired_price: Decimal,
    ) -> Result<StopReplacement, StopReplaceError> {
        let symbol = guard.symbol();

        // 1. ground truth
        let position = retry_call(self.retry, "get_position", || self.gateway.get_position(symbol)).await?;
        let side = match position.side {
            Some(side) if !position.is_flat() => side,
            _ => {
                let summary = self.cancel_classified(symbol, OrderClass::Protective, None).await?;
                self.store.remove_position(symbol);
                info!(symbol = %symbol, cleaned = summary.cancelled.len(), "stop replace aborted, position flat");
                return Err(StopReplaceError::Flat {
                    cleaned: summary.cancelled,
                });
            }
        };

        // 2. the gateway wins a side disagreement
        if side != direction {
            error!(
                alert = true,
                symbol = %symbol,
                requested = %direction,
                actual = %side,
                "side mismatch on stop replace, using gateway side"
            );
        }

        // 3. existing protection
        let before = retry_call(self.retry, "get_open_orders", || self.gateway.get_open_orders(symbol)).await?;
        let mut old_stops: BTreeSet<String> = protective_ids(&before);

        let rules = retry_call(self.retry, "get_instrument_rules", || {
            self.gateway.get_instrument_rules(symbol)
        })
        .await?;
        let quantity = floor_to_step(position.quantity, rules.step_size);
        if quantity <= Decimal::ZERO || quantity < rules.min_qty {
            return Err(SizingRejection::BelowMinQty {
                quantity,
                min_qty: rules.min_qty,
            }
            .into());
        }
        let stop_price = round_stop_to_tick(desired_price, rules.tick_size, side);
        if stop_price <= Decimal::ZERO {
            return Err(SizingRejection::NonPositive {
                field: "stop_price",
                value: stop_price,
            }
            .into());
        }
        let notional = quantity * stop_price;
        if notional < rules.min_notional {
            return Err(SizingRejection::BelowMinNotional {
                notional,
                min_notional: rules.min_notional,
            }
            .into());
        }

        // 4. place the new stop first; a blind retry could double it
        let request = OrderRequest::protective_stop(symbol, side, quantity, stop_price);
        let placed = retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "place_order", || {
            self.gateway.place_order(request.clone())
        })
        .await?;
        debug!(symbol = %symbol, order_id = %placed.order_id, stop = %stop_price, "new stop placed");

        // 5. confirm it is live before touching anything else
        let Some(after) = self.confirm_visible(symbol, &placed.order_id).await else {
            warn!(
                symbol = %symbol,
                order_id = %placed.order_id,
                attempts = self.config.confirm_attempts,
                "new stop not confirmed, keeping existing protection"
            );
            return Err(StopReplaceError::NotConfirmed {
                order_id: placed.order_id,
                attempts: self.config.confirm_attempts,
            });
        };

        // 6. cancel every other stop, never the new one, never a target
        old_stops.extend(protective_ids(&after));
        old_stops.remove(&placed.order_id);
        let mut cancelled = Vec::new();
        let mut zombies = Vec::new();
        for order_id in old_stops {
            match self.cancel_one(symbol, &order_id).await {
                Ok(()) => cancelled.push(order_id),
                Err(e) => {
                    // 7. duplicate stops are tolerable, a gap is not
                    error!(
                        alert = true,
                        symbol = %symbol,
                        order_id = %order_id,
                        error = %e,
                        "zombie SL risk: old stop failed to cancel"
                    );
                    zombies.push(order_id);
                }
            }
        }

        let remaining: Vec<Order> = after
            .into_iter()
            .filter(|o| !cancelled.contains(&o.order_id))
            .collect();
        self.store.set_orders_snapshot(symbol, remaining, Utc::now());

        info!(
            symbol = %symbol,
            side = %side,
            order_id = %placed.order_id,
            stop = %stop_price,
            cancelled = cancelled.len(),
            zombies = zombies.len(),
            "stop replaced"
        );

        Ok(StopReplacement {
            symbol: symbol.to_string(),
            order_id: placed.order_id,
            side,
            stop_price,
            quantity,
            cancelled,
            zombies,
        })
    }

    /// Cancels leftover stops for a symbol the gateway reports flat.
    ///
    /// Does nothing if a position is still open.
    ///
    /// # Errors
    /// Returns the gateway error if the position or orders cannot be read.
    pub async fn cleanup_flat(&self, symbol: &str) -> Result<CancelSummary, GatewayError> {
        let _guard = self.locks.lock(symbol).await;
        let position = retry_call(self.retry, "get_position", || self.gateway.get_position(symbol)).await?;
        if !position.is_flat() {
            return Ok(CancelSummary::default());
        }
        self.store.remove_position(symbol);
        self.cancel_classified(symbol, OrderClass::Protective, None).await
    }

    /// Cancels open orders of one class. Callers hold the symbol lock.
    ///
    /// Passing [`OrderClass::Target`] is reserved for full-position close logic.
    ///
    /// # Errors
    /// Returns the gateway error if open orders cannot be read.
    pub async fn cancel_classified(
        &self,
        symbol: &str,
        class: OrderClass,
        keep: Option<&str>,
    ) -> Result<CancelSummary, GatewayError> {
        let orders = retry_call(self.retry, "get_open_orders", || self.gateway.get_open_orders(symbol)).await?;
        let mut summary = CancelSummary::default();
        for order in orders
            .iter()
            .filter(|o| classify(o) == class && Some(o.order_id.as_str()) != keep)
        {
            match self.cancel_one(symbol, &order.order_id).await {
                Ok(()) => {
                    self.store.remove_order(symbol, &order.order_id);
                    summary.cancelled.push(order.order_id.clone());
                }
                Err(e) => {
                    warn!(symbol = %symbol, order_id = %order.order_id, error = %e, "cancel failed");
                    summary.failed.push(order.order_id.clone());
                }
            }
        }
        Ok(summary)
    }

    async fn cancel_one(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        match retry_call(self.retry, "cancel_order", || self.gateway.cancel_order(order_id, symbol)).await {
            // already gone counts as cancelled
            Ok(()) | Err(GatewayError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Polls open orders until `order_id` shows up, at most `confirm_attempts` times.
    async fn confirm_visible(&self, symbol: &str, order_id: &str) -> Option<Vec<Order>> {
        let attempts = self.config.confirm_attempts.max(1);
        let delay = Duration::from_millis(self.config.confirm_delay_ms);
        for attempt in 1..=attempts {
            tokio::time::sleep(delay).await;
            match retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "get_open_orders", || {
                self.gateway.get_open_orders(symbol)
            })
            .await
            {
                Ok(orders) if orders.iter().any(|o| o.order_id == order_id) => return Some(orders),
                Ok(_) => debug!(symbol = %symbol, order_id = %order_id, attempt, "new stop not visible yet"),
                Err(e) => debug!(symbol = %symbol, attempt, error = %e, "confirm poll failed"),
            }
        }
        None
    }
}

fn protective_ids(orders: &[Order]) -> BTreeSet<String> {
    orders
        .iter()
        .filter(|o| classify(o) == OrderClass::Protective)
        .map(|o| o.order_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperGateway;
    use riskgate_core::OrderSide;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperGateway>, StopReplacer) {
        let gw = Arc::new(PaperGateway::new(dec!(10000)));
        let replacer = StopReplacer::new(
            gw.clone(),
            Arc::new(StateStore::new()),
            Arc::new(SymbolLocks::new()),
            StopReplaceConfig {
                confirm_attempts: 3,
                confirm_delay_ms: 1,
            },
            RetryPolicy::default().with_backoff_ms(1),
        );
        (gw, replacer)
    }

    #[tokio::test]
    async fn test_replace_cancels_old_stop_only() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        let old = gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        let tp = gw.seed_order("BTCUSDT", "TAKE_PROFIT_MARKET", OrderSide::Sell, dec!(1), Some(dec!(110)), true);

        let result = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap();
        assert_eq!(result.cancelled, vec![old]);
        assert!(result.zombies.is_empty());
        assert_eq!(result.stop_price, dec!(98));

        let ids: Vec<String> = gw.all_orders("BTCUSDT").into_iter().map(|o| o.order_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&tp));
        assert!(ids.contains(&result.order_id));
    }

    #[tokio::test]
    async fn test_flat_position_cleans_up_instead() {
        let (gw, replacer) = setup();
        gw.set_mark_price("BTCUSDT", dec!(100));
        let stale = gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        let err = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap_err();
        assert!(!err.is_execution_failure());
        match err {
            StopReplaceError::Flat { cleaned } => assert_eq!(cleaned, vec![stale]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(gw.all_orders("BTCUSDT").is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_stop_keeps_old_one() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        let old = gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.hide_new_orders_for(10);

        let err = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap_err();
        assert!(matches!(err, StopReplaceError::NotConfirmed { attempts: 3, .. }));
        assert!(err.is_execution_failure());
        assert!(gw.all_orders("BTCUSDT").iter().any(|o| o.order_id == old));
    }

    #[tokio::test]
    async fn test_confirmation_tolerates_slow_visibility() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.hide_new_orders_for(2);
        let result = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap();
        assert_eq!(result.cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_cancel_reported_as_zombie() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        let old = gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.fail_cancel(&old);
        let result = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap();
        assert_eq!(result.zombies, vec![old]);
        assert_eq!(gw.all_orders("BTCUSDT").len(), 2);
    }

    #[tokio::test]
    async fn test_side_mismatch_uses_gateway_side() {
        let (gw, replacer) = setup();
        gw.seed_position("ETHUSDT", Side::Short, dec!(2), dec!(100));
        let result = replacer.replace_stop("ETHUSDT", Side::Long, dec!(103)).await.unwrap();
        assert_eq!(result.side, Side::Short);
        let placed = gw.all_orders("ETHUSDT");
        assert_eq!(placed[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_placement_failure_keeps_old_stop() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        let old = gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.fail_next_places(1);
        let err = replacer.replace_stop("BTCUSDT", Side::Long, dec!(98)).await.unwrap_err();
        assert!(matches!(err, StopReplaceError::Gateway(_)));
        let orders = gw.all_orders("BTCUSDT");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, old);
    }

    #[tokio::test]
    async fn test_wrong_side_stop_rejected_by_exchange() {
        let (gw, replacer) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        let err = replacer.replace_stop("BTCUSDT", Side::Long, dec!(101)).await.unwrap_err();
        assert!(matches!(err, StopReplaceError::Gateway(GatewayError::Rejected { .. })));
    }
}
