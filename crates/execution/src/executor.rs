//! Entries and reduce-only exits.
//!
//! Every operation re-reads the position from the gateway before acting and
//! holds the symbol's mutation lock, so it never races a stop replacement.

use chrono::Utc;
use riskgate_core::order_class::OrderClass;
use riskgate_core::{
    retry_call, EntrySignal, ExchangeGateway, GatewayError, OrderRequest, PositionSnapshot, RetryPolicy, Side,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::filters::{floor_to_step, normalize_quantity, SizingRejection};
use crate::state_store::StateStore;
use crate::stop_replacer::{StopReplacement, StopReplacer};
use crate::symbol_locks::SymbolLocks;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{symbol} already has an open {side} position")]
    AlreadyOpen { symbol: String, side: Side },

    #[error("order size rejected: {0}")]
    Sizing(#[from] SizingRejection),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("entry order for {symbol} did not produce a position")]
    EntryNotFilled { symbol: String },

    /// The initial stop could not be confirmed. The position was flattened.
    #[error("entry on {symbol} could not be protected: {reason}")]
    UnprotectedEntry { symbol: String, reason: String },
}

impl ExecutionError {
    /// Errors that count toward the execution-failure circuit breaker.
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::Gateway(_) | Self::EntryNotFilled { .. } | Self::UnprotectedEntry { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFill {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop: StopReplacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseFill {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Position left on the exchange after the close.
    pub remaining: Decimal,
}

pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<StateStore>,
    locks: Arc<SymbolLocks>,
    replacer: Arc<StopReplacer>,
    retry: RetryPolicy,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<StateStore>,
        locks: Arc<SymbolLocks>,
        replacer: Arc<StopReplacer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            locks,
            replacer,
            retry,
        }
    }

    #[must_use]
    pub fn replacer(&self) -> &Arc<StopReplacer> {
        &self.replacer
    }

    async fn fetch_position(&self, symbol: &str) -> Result<PositionSnapshot, GatewayError> {
        retry_call(self.retry, "get_position", || self.gateway.get_position(symbol)).await
    }

    /// Opens `quantity` in the signal's direction and protects it with the
    /// signal's stop.
    ///
    /// # Errors
    /// Fails without trading if a position already exists or the size is below
    /// exchange minimums. If the stop cannot be confirmed the new position is
    /// closed again and [`ExecutionError::UnprotectedEntry`] is returned.
    pub async fn open_position(&self, signal: &EntrySignal, quantity: Decimal) -> Result<EntryFill, ExecutionError> {
        let symbol = signal.symbol.as_str();
        let guard = self.locks.lock(symbol).await;

        let existing = self.fetch_position(symbol).await?;
        if let (false, Some(side)) = (existing.is_flat(), existing.side) {
            return Err(ExecutionError::AlreadyOpen {
                symbol: symbol.to_string(),
                side,
            });
        }

        let rules = retry_call(self.retry, "get_instrument_rules", || {
            self.gateway.get_instrument_rules(symbol)
        })
        .await?;
        let mark = retry_call(self.retry, "get_mark_price", || self.gateway.get_mark_price(symbol)).await?;
        let quantity = normalize_quantity(quantity, mark, &rules)?;

        let request = OrderRequest::market(symbol, signal.side.entry_side(), quantity);
        retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "place_order", || {
            self.gateway.place_order(request.clone())
        })
        .await?;

        let filled = self.fetch_position(symbol).await?;
        if filled.is_flat() {
            error!(alert = true, symbol = %symbol, "entry order accepted but no position appeared");
            return Err(ExecutionError::EntryNotFilled {
                symbol: symbol.to_string(),
            });
        }

        let stop = match self
            .replacer
            .replace_stop_locked(&guard, signal.side, signal.stop_price)
            .await
        {
            Ok(stop) => stop,
            Err(e) => {
                error!(
                    alert = true,
                    symbol = %symbol,
                    error = %e,
                    "initial stop failed, flattening new position"
                );
                let side = filled.side.unwrap_or(signal.side);
                if let Err(close_err) = self.flatten_unprotected(symbol, side, filled.quantity).await {
                    error!(
                        alert = true,
                        symbol = %symbol,
                        error = %close_err,
                        "CRITICAL: could not flatten unprotected entry"
                    );
                }
                return Err(ExecutionError::UnprotectedEntry {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let position = self.store.upsert_position(filled.clone(), Utc::now());
        info!(
            symbol = %symbol,
            side = %signal.side,
            quantity = %filled.quantity,
            entry = %filled.entry_price,
            stop = %stop.stop_price,
            "position opened"
        );
        drop(guard);

        Ok(EntryFill {
            symbol: symbol.to_string(),
            side: position.map_or(signal.side, |p| p.side),
            quantity: filled.quantity,
            entry_price: filled.entry_price,
            stop,
        })
    }

    /// Closes a position that could not be protected.
    ///
    /// Each attempt places once, then re-reads the position before the next,
    /// so a close that landed despite an error is never sent twice.
    async fn flatten_unprotected(&self, symbol: &str, side: Side, quantity: Decimal) -> Result<(), GatewayError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut remaining = quantity;
        let mut attempt = 1;
        loop {
            let request = OrderRequest::reduce(symbol, side, remaining);
            let err = match retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "place_order", || {
                self.gateway.place_order(request.clone())
            })
            .await
            {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if attempt >= attempts {
                return Err(err);
            }
            warn!(symbol = %symbol, attempt, error = %err, "flatten failed, re-reading position");
            tokio::time::sleep(Duration::from_millis(self.retry.backoff_ms)).await;
            let position = self.fetch_position(symbol).await?;
            if position.is_flat() {
                return Ok(());
            }
            remaining = position.quantity;
            attempt += 1;
        }
    }

    /// Closes `ratio` of the current position with a reduce-only market order.
    ///
    /// Returns `Ok(None)` when flat or when the slice is below the exchange
    /// minimums; the close is skipped, never enlarged.
    ///
    /// # Errors
    /// Returns gateway errors from reading or placing.
    pub async fn close_partial(&self, symbol: &str, ratio: Decimal) -> Result<Option<CloseFill>, ExecutionError> {
        let _guard = self.locks.lock(symbol).await;
        let position = self.fetch_position(symbol).await?;
        let Some(side) = position.side.filter(|_| !position.is_flat()) else {
            return Ok(None);
        };

        let rules = retry_call(self.retry, "get_instrument_rules", || {
            self.gateway.get_instrument_rules(symbol)
        })
        .await?;
        let mark = retry_call(self.retry, "get_mark_price", || self.gateway.get_mark_price(symbol)).await?;

        let quantity = floor_to_step(position.quantity * ratio, rules.step_size).min(position.quantity);
        if quantity < rules.min_qty || quantity <= Decimal::ZERO || quantity * mark < rules.min_notional {
            info!(
                symbol = %symbol,
                quantity = %quantity,
                ratio = %ratio,
                "partial close skipped, below exchange minimum"
            );
            return Ok(None);
        }

        let request = OrderRequest::reduce(symbol, side, quantity);
        retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "place_order", || {
            self.gateway.place_order(request.clone())
        })
        .await?;

        let after = self.fetch_position(symbol).await?;
        let remaining = if after.is_flat() { Decimal::ZERO } else { after.quantity };
        self.store.upsert_position(after, Utc::now());
        info!(symbol = %symbol, side = %side, quantity = %quantity, remaining = %remaining, "partial close");

        Ok(Some(CloseFill {
            symbol: symbol.to_string(),
            side,
            quantity,
            remaining,
        }))
    }

    /// Closes the whole position, then clears its stops and take-profits.
    ///
    /// The market close goes first so a failed close never strips protection.
    /// This is the only place take-profit orders are cancelled.
    ///
    /// # Errors
    /// Returns gateway errors from reading or placing.
    pub async fn close_all(&self, symbol: &str) -> Result<Option<CloseFill>, ExecutionError> {
        let _guard = self.locks.lock(symbol).await;
        let position = self.fetch_position(symbol).await?;

        let fill = match position.side.filter(|_| !position.is_flat()) {
            Some(side) => {
                let request = OrderRequest::reduce(symbol, side, position.quantity);
                retry_call(RetryPolicy::once(self.retry.call_timeout_ms), "place_order", || {
                    self.gateway.place_order(request.clone())
                })
                .await?;
                Some(CloseFill {
                    symbol: symbol.to_string(),
                    side,
                    quantity: position.quantity,
                    remaining: Decimal::ZERO,
                })
            }
            None => None,
        };

        let after = self.fetch_position(symbol).await?;
        if !after.is_flat() {
            warn!(
                symbol = %symbol,
                remaining = %after.quantity,
                "position still open after close, keeping its orders"
            );
            self.store.upsert_position(after.clone(), Utc::now());
            return Ok(fill.map(|f| CloseFill {
                remaining: after.quantity,
                ..f
            }));
        }

        self.store.remove_position(symbol);
        let stops = self
            .replacer
            .cancel_classified(symbol, OrderClass::Protective, None)
            .await?;
        let targets = self
            .replacer
            .cancel_classified(symbol, OrderClass::Target, None)
            .await?;
        info!(
            symbol = %symbol,
            closed = fill.is_some(),
            stops = stops.cancelled.len(),
            targets = targets.cancelled.len(),
            "position closed"
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperGateway;
    use chrono::Utc;
    use riskgate_core::config::StopReplaceConfig;
    use riskgate_core::order_class::is_protective;
    use riskgate_core::OrderSide;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn setup() -> (Arc<PaperGateway>, Arc<StateStore>, OrderExecutor) {
        let gw = Arc::new(PaperGateway::new(dec!(10000)));
        gw.set_mark_price("BTCUSDT", dec!(100));
        let store = Arc::new(StateStore::new());
        let locks = Arc::new(SymbolLocks::new());
        let retry = RetryPolicy::default().with_backoff_ms(1);
        let replacer = Arc::new(StopReplacer::new(
            gw.clone(),
            store.clone(),
            locks.clone(),
            StopReplaceConfig {
                confirm_attempts: 3,
                confirm_delay_ms: 1,
            },
            retry,
        ));
        let executor = OrderExecutor::new(gw.clone(), store.clone(), locks, replacer, retry);
        (gw, store, executor)
    }

    fn signal(side: Side, stop: Decimal) -> EntrySignal {
        EntrySignal {
            symbol: "BTCUSDT".into(),
            side,
            signal_type: "trend_pullback".into(),
            timeframe: "15m".into(),
            bar_time: Utc::now(),
            entry_ref: dec!(100),
            stop_price: stop,
            extras: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_open_position_places_confirmed_stop() {
        let (gw, store, executor) = setup();
        let fill = executor.open_position(&signal(Side::Long, dec!(98)), dec!(1.5)).await.unwrap();
        assert_eq!(fill.quantity, dec!(1.5));
        assert_eq!(fill.stop.stop_price, dec!(98));
        assert_eq!(gw.position_quantity("BTCUSDT"), dec!(1.5));
        assert!(gw.all_orders("BTCUSDT").iter().any(is_protective));
        assert!(store.position("BTCUSDT").is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_existing_position() {
        let (gw, _store, executor) = setup();
        gw.seed_position("BTCUSDT", Side::Short, dec!(1), dec!(100));
        let err = executor.open_position(&signal(Side::Long, dec!(98)), dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyOpen { side: Side::Short, .. }));
        assert!(!err.is_execution_failure());
    }

    #[tokio::test]
    async fn test_open_below_min_notional_is_skipped() {
        let (gw, _store, executor) = setup();
        let err = executor.open_position(&signal(Side::Long, dec!(98)), dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Sizing(_)));
        assert_eq!(gw.position_quantity("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unprotectable_entry_is_flattened() {
        let (gw, _store, executor) = setup();
        // stop above mark for a long would trigger immediately
        let err = executor.open_position(&signal(Side::Long, dec!(101)), dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnprotectedEntry { .. }));
        assert!(err.is_execution_failure());
        assert_eq!(gw.position_quantity("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unprotected_flatten_rereads_before_retrying() {
        let (gw, _store, executor) = setup();
        gw.fail_next_closes(1);
        let err = executor.open_position(&signal(Side::Long, dec!(101)), dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnprotectedEntry { .. }));
        assert_eq!(gw.position_quantity("BTCUSDT"), Decimal::ZERO);
        // one failed close, one successful close, nothing more
        let closes = gw
            .fills()
            .iter()
            .filter(|f| f.symbol == "BTCUSDT" && f.side == OrderSide::Sell)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_unprotected_flatten_gives_up_after_attempts() {
        let (gw, _store, executor) = setup();
        gw.fail_next_closes(10);
        let err = executor.open_position(&signal(Side::Long, dec!(101)), dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnprotectedEntry { .. }));
        assert_eq!(gw.position_quantity("BTCUSDT"), dec!(1));
    }

    #[tokio::test]
    async fn test_close_partial_floors_to_step() {
        let (gw, _store, executor) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1.001), dec!(100));
        let fill = executor.close_partial("BTCUSDT", dec!(0.4)).await.unwrap().unwrap();
        assert_eq!(fill.quantity, dec!(0.4));
        assert_eq!(fill.remaining, dec!(0.601));
    }

    #[tokio::test]
    async fn test_close_partial_below_minimum_skips() {
        let (gw, _store, executor) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(0.06), dec!(100));
        assert_eq!(executor.close_partial("BTCUSDT", dec!(0.4)).await.unwrap(), None);
        assert_eq!(gw.position_quantity("BTCUSDT"), dec!(0.06));
    }

    #[tokio::test]
    async fn test_close_all_clears_stops_and_targets() {
        let (gw, store, executor) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.seed_order("BTCUSDT", "TAKE_PROFIT_MARKET", OrderSide::Sell, dec!(1), Some(dec!(110)), true);
        gw.seed_order("BTCUSDT", "LIMIT", OrderSide::Buy, dec!(1), None, false);
        let fill = executor.close_all("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(fill.quantity, dec!(1));
        assert_eq!(gw.position_quantity("BTCUSDT"), Decimal::ZERO);
        let left = gw.all_orders("BTCUSDT");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].order_type, "LIMIT");
        assert!(store.position("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_failed_close_keeps_protection() {
        let (gw, _store, executor) = setup();
        gw.seed_position("BTCUSDT", Side::Long, dec!(1), dec!(100));
        gw.seed_order("BTCUSDT", "STOP_MARKET", OrderSide::Sell, dec!(1), Some(dec!(95)), true);
        gw.fail_next_places(1);
        assert!(executor.close_all("BTCUSDT").await.is_err());
        assert_eq!(gw.all_orders("BTCUSDT").len(), 1);
    }
}
