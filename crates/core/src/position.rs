use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::events::OrderSide;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    #[must_use]
    pub const fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => anyhow::bail!("unknown position side: {other}"),
        }
    }
}

/// Raw answer of the gateway's position query.
///
/// A quantity of zero (or below) means the exchange reports the symbol as flat;
/// `side` is then meaningless and usually `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: Option<Side>,
    pub entry_price: Decimal,
}

impl PositionSnapshot {
    #[must_use]
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            side: None,
            entry_price: Decimal::ZERO,
        }
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity <= Decimal::ZERO || self.side.is_none()
    }

    /// Converts to a cached [`Position`], or `None` when flat.
    #[must_use]
    pub fn into_position(self, opened_at: DateTime<Utc>) -> Option<Position> {
        if self.is_flat() {
            return None;
        }
        let side = self.side?;
        Some(Position {
            symbol: self.symbol,
            side,
            quantity: self.quantity,
            entry_price: self.entry_price,
            opened_at,
        })
    }
}

/// Best-effort local copy of an exchange position.
///
/// The exchange owns the truth. Anything holding one of these must re-derive it
/// from the gateway at least once per reconciliation interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Return on entry at `mark`, signed by side. Zero when the entry is unknown.
    #[must_use]
    pub fn roi(&self, mark: Decimal) -> Decimal {
        roi(self.side, self.entry_price, mark)
    }
}

/// `(mark - entry) / entry` for longs, the negation for shorts.
#[must_use]
pub fn roi(side: Side, entry: Decimal, mark: Decimal) -> Decimal {
    if entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match side {
        Side::Long => (mark - entry) / entry,
        Side::Short => (entry - mark) / entry,
    }
}
