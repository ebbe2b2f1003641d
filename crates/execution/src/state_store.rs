//! In-memory cache of last-known positions and open orders.
//!
//! Written by the reconciler and the stop replacer, read by everything. All
//! access goes through one mutex and every read returns an owned copy, so no
//! caller can hold a reference into a map another task is mutating.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use riskgate_core::{Order, Position, PositionSnapshot};
use std::collections::HashMap;
use tracing::debug;

const TERMINAL_STATUSES: [&str; 5] = ["FILLED", "CANCELED", "CANCELLED", "EXPIRED", "REJECTED"];

/// The maps guarded by the store's lock.
#[derive(Debug, Default, Clone)]
pub struct StoreInner {
    pub positions: HashMap<String, Position>,
    pub open_orders: HashMap<String, HashMap<String, Order>>,
    /// Last push event seen per symbol.
    pub last_event_at: HashMap<String, DateTime<Utc>>,
    /// Last REST snapshot taken per symbol.
    pub last_snapshot_at: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the lock held for the whole read-modify-write sequence.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    /// Applies a gateway position snapshot. A flat snapshot removes the entry.
    ///
    /// `opened_at` is kept from the cached copy while the side is unchanged.
    pub fn upsert_position(&self, snapshot: PositionSnapshot, now: DateTime<Utc>) -> Option<Position> {
        let symbol = snapshot.symbol.clone();
        self.transaction(|inner| {
            let opened_at = match (inner.positions.get(&symbol), snapshot.side) {
                (Some(cached), Some(side)) if cached.side == side => cached.opened_at,
                _ => now,
            };
            match snapshot.into_position(opened_at) {
                Some(position) => {
                    inner.positions.insert(symbol, position.clone());
                    Some(position)
                }
                None => {
                    if inner.positions.remove(&symbol).is_some() {
                        debug!(symbol = %symbol, "cached position removed, gateway reports flat");
                    }
                    None
                }
            }
        })
    }

    /// Inserts a position with a known open time, e.g. restored from disk.
    pub fn restore_position(&self, position: Position) {
        self.transaction(|inner| {
            inner.positions.insert(position.symbol.clone(), position);
        });
    }

    pub fn remove_position(&self, symbol: &str) -> Option<Position> {
        self.transaction(|inner| inner.positions.remove(symbol))
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().positions.get(symbol).cloned()
    }

    /// All cached positions, sorted by symbol.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.lock().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Replaces the cached open orders of `symbol` with a fresh snapshot.
    pub fn set_orders_snapshot(&self, symbol: &str, orders: Vec<Order>, now: DateTime<Utc>) {
        self.transaction(|inner| {
            let map = orders
                .into_iter()
                .map(|o| (o.order_id.clone(), o))
                .collect::<HashMap<_, _>>();
            inner.open_orders.insert(symbol.to_string(), map);
            inner.last_snapshot_at.insert(symbol.to_string(), now);
        });
    }

    pub fn upsert_order(&self, order: Order) {
        self.transaction(|inner| {
            inner
                .open_orders
                .entry(order.symbol.clone())
                .or_default()
                .insert(order.order_id.clone(), order);
        });
    }

    /// Applies an order status update. Terminal statuses drop the order.
    pub fn apply_order_status(&self, symbol: &str, order_id: &str, status: &str) {
        let terminal = TERMINAL_STATUSES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(status));
        if terminal {
            self.remove_order(symbol, order_id);
        }
    }

    pub fn remove_order(&self, symbol: &str, order_id: &str) -> Option<Order> {
        self.transaction(|inner| {
            inner
                .open_orders
                .get_mut(symbol)
                .and_then(|orders| orders.remove(order_id))
        })
    }

    /// Cached open orders of `symbol`, sorted by order id.
    #[must_use]
    pub fn open_orders(&self, symbol: &str) -> Vec<Order> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .open_orders
            .get(symbol)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    /// Records that the push feed delivered something for `symbol`.
    ///
    /// Out-of-order events never move the timestamp backwards.
    pub fn record_event_seen(&self, symbol: &str, at: DateTime<Utc>) {
        self.transaction(|inner| {
            let entry = inner.last_event_at.entry(symbol.to_string()).or_insert(at);
            if at > *entry {
                *entry = at;
            }
        });
    }

    #[must_use]
    pub fn last_event_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().last_event_at.get(symbol).copied()
    }

    #[must_use]
    pub fn last_snapshot_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().last_snapshot_at.get(symbol).copied()
    }

    /// True if neither the push feed nor a REST snapshot touched `symbol`
    /// within `max_age`.
    #[must_use]
    pub fn is_stale(&self, symbol: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock();
        let latest = [
            inner.last_event_at.get(symbol),
            inner.last_snapshot_at.get(symbol),
        ]
        .into_iter()
        .flatten()
        .max()
        .copied();
        latest.map_or(true, |at| now - at > max_age)
    }

    /// Full copy of the store, for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> StoreInner {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskgate_core::{OrderSide, Side};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn snap(symbol: &str, qty: rust_decimal::Decimal, side: Option<Side>) -> PositionSnapshot {
        PositionSnapshot {
            symbol: symbol.into(),
            quantity: qty,
            side,
            entry_price: dec!(100),
        }
    }

    fn order(id: &str) -> Order {
        Order {
            order_id: id.into(),
            symbol: "BTCUSDT".into(),
            order_type: "STOP_MARKET".into(),
            side: OrderSide::Sell,
            quantity: dec!(1),
            trigger_price: Some(dec!(90)),
            reduce_only: true,
            close_position: false,
        }
    }

    #[test]
    fn test_flat_snapshot_removes_position() {
        let store = StateStore::new();
        let now = Utc::now();
        store.upsert_position(snap("BTCUSDT", dec!(1), Some(Side::Long)), now);
        assert!(store.position("BTCUSDT").is_some());
        store.upsert_position(snap("BTCUSDT", dec!(0), None), now);
        assert!(store.position("BTCUSDT").is_none());
    }

    #[test]
    fn test_opened_at_kept_while_side_unchanged() {
        let store = StateStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);
        store.upsert_position(snap("BTCUSDT", dec!(2), Some(Side::Long)), t0);
        let p = store.upsert_position(snap("BTCUSDT", dec!(1), Some(Side::Long)), t1).unwrap();
        assert_eq!(p.opened_at, t0);
        let flipped = store.upsert_position(snap("BTCUSDT", dec!(1), Some(Side::Short)), t1).unwrap();
        assert_eq!(flipped.opened_at, t1);
    }

    #[test]
    fn test_reads_are_defensive_copies() {
        let store = StateStore::new();
        store.upsert_order(order("1"));
        let mut copy = store.open_orders("BTCUSDT");
        copy.clear();
        assert_eq!(store.open_orders("BTCUSDT").len(), 1);
    }

    #[test]
    fn test_terminal_status_removes_order() {
        let store = StateStore::new();
        store.upsert_order(order("1"));
        store.apply_order_status("BTCUSDT", "1", "NEW");
        assert_eq!(store.open_orders("BTCUSDT").len(), 1);
        store.apply_order_status("BTCUSDT", "1", "canceled");
        assert!(store.open_orders("BTCUSDT").is_empty());
    }

    #[test]
    fn test_event_time_never_moves_backwards() {
        let store = StateStore::new();
        let t0 = Utc::now();
        store.record_event_seen("ETHUSDT", t0);
        store.record_event_seen("ETHUSDT", t0 - Duration::seconds(30));
        assert_eq!(store.last_event_at("ETHUSDT"), Some(t0));
    }

    #[test]
    fn test_staleness_uses_latest_of_event_and_snapshot() {
        let store = StateStore::new();
        let now = Utc::now();
        assert!(store.is_stale("ETHUSDT", Duration::seconds(60), now));
        store.record_event_seen("ETHUSDT", now - Duration::seconds(300));
        assert!(store.is_stale("ETHUSDT", Duration::seconds(60), now));
        store.set_orders_snapshot("ETHUSDT", vec![], now - Duration::seconds(10));
        assert!(!store.is_stale("ETHUSDT", Duration::seconds(60), now));
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let store = Arc::new(StateStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let mut o = order(&format!("{t}-{i}"));
                        o.symbol = "BTCUSDT".into();
                        store.upsert_order(o);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.open_orders("BTCUSDT").len(), 800);
    }
}
