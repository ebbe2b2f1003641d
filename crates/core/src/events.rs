use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::position::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order types this engine places. Stops and targets trigger on mark price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    /// Exchange type string, as it comes back in open-order listings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// An open order as reported by the exchange.
///
/// `order_type` stays a raw string: the exchange may report types this engine
/// never places, and classification has to cope with all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub order_type: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
}

impl OrderRequest {
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            quantity,
            trigger_price: None,
            reduce_only: false,
        }
    }

    /// Reduce-only market order closing `quantity` of a `position_side` position.
    #[must_use]
    pub fn reduce(symbol: impl Into<String>, position_side: Side, quantity: Decimal) -> Self {
        Self {
            reduce_only: true,
            ..Self::market(symbol, position_side.exit_side(), quantity)
        }
    }

    /// Reduce-only stop-market protecting a `position_side` position.
    #[must_use]
    pub fn protective_stop(
        symbol: impl Into<String>,
        position_side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::StopMarket,
            side: position_side.exit_side(),
            quantity,
            trigger_price: Some(stop_price),
            reduce_only: true,
        }
    }
}

/// Exchange trading constraints for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

impl Default for InstrumentRules {
    fn default() -> Self {
        Self {
            min_qty: Decimal::new(1, 3),
            step_size: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
            min_notional: Decimal::from(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub quote_volume_24h: Decimal,
}

impl BookTicker {
    /// Bid/ask spread as a percentage of mid. `None` for an empty book.
    #[must_use]
    pub fn spread_pct(&self) -> Option<Decimal> {
        let mid = (self.bid + self.ask) / Decimal::TWO;
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO || mid <= Decimal::ZERO {
            return None;
        }
        Some((self.ask - self.bid) / mid * Decimal::ONE_HUNDRED)
    }
}

/// Push notification from the exchange user stream.
///
/// Inside this engine these only refresh "last seen" bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangeEvent {
    OrderUpdate {
        symbol: String,
        order_id: String,
        status: String,
        event_time: DateTime<Utc>,
    },
    PositionUpdate {
        symbol: String,
        quantity: Decimal,
        event_time: DateTime<Utc>,
    },
    AccountUpdate {
        symbol: String,
        event_time: DateTime<Utc>,
    },
}

impl ExchangeEvent {
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::OrderUpdate { symbol, .. }
            | Self::PositionUpdate { symbol, .. }
            | Self::AccountUpdate { symbol, .. } => symbol,
        }
    }

    #[must_use]
    pub const fn event_time(&self) -> DateTime<Utc> {
        match self {
            Self::OrderUpdate { event_time, .. }
            | Self::PositionUpdate { event_time, .. }
            | Self::AccountUpdate { event_time, .. } => *event_time,
        }
    }
}
