//! Entry signal contract.
//!
//! Signal generation itself lives outside this engine; anything implementing
//! [`crate::traits::SignalSource`] can feed entries into the decision loop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::fingerprint::SetupContext;
use crate::market::{MarketGate, MarketSnapshot, Regime};
use crate::position::Side;

/// Regime context handed to a signal source alongside the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeView {
    pub regime: Regime,
    pub gate: MarketGate,
    /// Entry mode label of the active regime settings, e.g. `trend_pullback`.
    pub mode: String,
    pub new_long_enabled: bool,
}

/// A proposed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: Side,
    pub signal_type: String,
    pub timeframe: String,
    pub bar_time: DateTime<Utc>,
    /// Reference entry price the signal was computed against.
    pub entry_ref: Decimal,
    /// Initial protective stop.
    pub stop_price: Decimal,
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl EntrySignal {
    /// Stop distance as a fraction of the reference entry.
    #[must_use]
    pub fn stop_distance_pct(&self) -> Decimal {
        if self.entry_ref <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.entry_ref - self.stop_price).abs() / self.entry_ref
    }

    /// Setup context for fingerprinting, enriched with the snapshot's indicators.
    #[must_use]
    pub fn setup_context(&self, snapshot: &MarketSnapshot) -> SetupContext {
        SetupContext {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            signal_type: self.signal_type.clone(),
            bar_time_ms: self.bar_time.timestamp_millis(),
            entry_ref: self.entry_ref,
            adx: snapshot.adx,
            rsi: snapshot.rsi,
            bb_width: snapshot.bb_width,
            vol_spike_mult: snapshot.vol_spike_mult,
            extras: self.extras.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stop_distance_pct() {
        let signal = EntrySignal {
            symbol: "SOLUSDT".into(),
            side: Side::Short,
            signal_type: "breakdown".into(),
            timeframe: "15m".into(),
            bar_time: Utc::now(),
            entry_ref: dec!(100),
            stop_price: dec!(102),
            extras: BTreeMap::new(),
        };
        assert_eq!(signal.stop_distance_pct(), dec!(0.02));
    }
}
