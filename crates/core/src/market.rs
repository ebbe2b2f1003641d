use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Indicator values for one instrument on its latest confirmed bar.
///
/// Produced by the external candle/indicator provider; this engine never
/// computes indicators itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bar_time: DateTime<Utc>,
    pub close: Decimal,
    pub adx: f64,
    /// Absolute ATR in price units.
    pub atr: f64,
    /// ATR as a percentage of close.
    pub atr_pct: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    /// Change of the fast EMA over the slope lookback.
    pub ema_fast_slope: f64,
    #[serde(default)]
    pub rsi: f64,
    #[serde(default)]
    pub bb_width: f64,
    #[serde(default)]
    pub vol_spike_mult: f64,
    /// Rank by traded volume within the universe, 0 = most liquid.
    #[serde(default)]
    pub volume_rank: u32,
}

impl MarketSnapshot {
    /// Fast/slow EMA gap as a percentage of the slow EMA.
    #[must_use]
    pub fn ema_diff_pct(&self) -> f64 {
        if self.ema_slow.abs() < f64::EPSILON {
            return 0.0;
        }
        (self.ema_fast - self.ema_slow) / self.ema_slow * 100.0
    }
}

/// Open and latest price of the benchmark's current short-timeframe bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuseBar {
    pub open: Decimal,
    pub last: Decimal,
    /// ATR% of the short timeframe, as a fraction (0.01 = 1%).
    pub atr_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "RANGE_LOWVOL")]
    RangeLowVol,
    #[serde(rename = "RANGE_HIGHVOL")]
    RangeHighVol,
    #[serde(rename = "UPTREND_LOWVOL")]
    UptrendLowVol,
    #[serde(rename = "UPTREND_HIGHVOL")]
    UptrendHighVol,
    #[serde(rename = "DOWNTREND_LOWVOL")]
    DowntrendLowVol,
    #[serde(rename = "DOWNTREND_HIGHVOL")]
    DowntrendHighVol,
}

impl Regime {
    pub const ALL: [Self; 6] = [
        Self::RangeLowVol,
        Self::RangeHighVol,
        Self::UptrendLowVol,
        Self::UptrendHighVol,
        Self::DowntrendLowVol,
        Self::DowntrendHighVol,
    ];

    #[must_use]
    pub const fn from_axes(trend: TrendDirection, high_vol: bool) -> Self {
        match (trend, high_vol) {
            (TrendDirection::Range, false) => Self::RangeLowVol,
            (TrendDirection::Range, true) => Self::RangeHighVol,
            (TrendDirection::Up, false) => Self::UptrendLowVol,
            (TrendDirection::Up, true) => Self::UptrendHighVol,
            (TrendDirection::Down, false) => Self::DowntrendLowVol,
            (TrendDirection::Down, true) => Self::DowntrendHighVol,
        }
    }

    #[must_use]
    pub const fn is_high_vol(self) -> bool {
        matches!(
            self,
            Self::RangeHighVol | Self::UptrendHighVol | Self::DowntrendHighVol
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RangeLowVol => "RANGE_LOWVOL",
            Self::RangeHighVol => "RANGE_HIGHVOL",
            Self::UptrendLowVol => "UPTREND_LOWVOL",
            Self::UptrendHighVol => "UPTREND_HIGHVOL",
            Self::DowntrendLowVol => "DOWNTREND_LOWVOL",
            Self::DowntrendHighVol => "DOWNTREND_HIGHVOL",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Range,
}

/// Aggregate risk posture derived from the benchmark's regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketGate {
    #[default]
    Normal,
    #[serde(rename = "RISKOFF")]
    RiskOff,
    Panic,
}

impl MarketGate {
    #[must_use]
    pub const fn from_regime(regime: Regime) -> Self {
        match regime {
            Regime::DowntrendHighVol => Self::Panic,
            Regime::RangeHighVol | Regime::DowntrendLowVol => Self::RiskOff,
            _ => Self::Normal,
        }
    }

    /// True for RISKOFF and PANIC.
    #[must_use]
    pub const fn is_defensive(self) -> bool {
        !matches!(self, Self::Normal)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::RiskOff => "RISKOFF",
            Self::Panic => "PANIC",
        }
    }
}

impl fmt::Display for MarketGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_mapping() {
        assert_eq!(MarketGate::from_regime(Regime::DowntrendHighVol), MarketGate::Panic);
        assert_eq!(MarketGate::from_regime(Regime::RangeHighVol), MarketGate::RiskOff);
        assert_eq!(MarketGate::from_regime(Regime::DowntrendLowVol), MarketGate::RiskOff);
        for regime in [Regime::RangeLowVol, Regime::UptrendLowVol, Regime::UptrendHighVol] {
            assert_eq!(MarketGate::from_regime(regime), MarketGate::Normal);
        }
    }

    #[test]
    fn test_regime_axes_roundtrip_high_vol() {
        for regime in Regime::ALL {
            let high = regime.is_high_vol();
            assert_eq!(regime.as_str().ends_with("HIGHVOL"), high);
        }
        assert_eq!(
            Regime::from_axes(TrendDirection::Down, true),
            Regime::DowntrendHighVol
        );
    }

    #[test]
    fn test_regime_serializes_as_display_name() {
        for regime in Regime::ALL {
            let json = serde_json::to_string(&regime).unwrap();
            assert_eq!(json, format!("\"{regime}\""));
        }
    }
}
