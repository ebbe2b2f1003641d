//! Typed configuration for every component, with documented defaults.
//!
//! All sections carry `#[serde(default)]`, so a config file only needs the
//! values it overrides.

use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::market::{MarketGate, Regime};
use crate::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown timezone: {0}")]
    Timezone(String),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub retry: RetryPolicy,
    pub stop_replace: StopReplaceConfig,
    pub reconcile: ReconcileConfig,
    pub regime: RegimeConfig,
    pub regime_settings: RegimeSettingsConfig,
    pub portfolio: PortfolioRiskConfig,
    pub scorer: ScorerConfig,
    pub lifecycle: LifecycleConfig,
    pub entry_gate: EntryGateConfig,
    pub fuse: FuseConfig,
    pub fee_guard: FeeGuardConfig,
}

impl AppConfig {
    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        self.stop_replace.validate()?;
        if self.reconcile.interval_secs == 0 {
            return Err(invalid("reconcile.interval_secs", "must be positive"));
        }
        self.regime.validate()?;
        self.regime_settings.validate()?;
        self.portfolio.validate()?;
        self.scorer.validate()?;
        self.lifecycle.validate()?;
        self.entry_gate.validate()?;
        self.fuse.validate()?;
        self.fee_guard.validate()?;
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tradable universe.
    pub symbols: Vec<String>,
    /// Instrument whose regime drives the market gate and the crash fuse.
    pub benchmark_symbol: String,
    pub timeframe: String,
    /// Length of one bar, used for time-based exits.
    pub bar_minutes: u32,
    pub decision_interval_secs: u64,
    /// A symbol with no push event for this long is reported as stale.
    pub stale_after_secs: u64,
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            benchmark_symbol: "BTCUSDT".to_string(),
            timeframe: "15m".to_string(),
            bar_minutes: 15,
            decision_interval_secs: 10,
            stale_after_secs: 120,
            state_dir: PathBuf::from("state"),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(invalid("engine.symbols", "at least one symbol required"));
        }
        if self.benchmark_symbol.trim().is_empty() {
            return Err(invalid("engine.benchmark_symbol", "must not be empty"));
        }
        if self.bar_minutes == 0 {
            return Err(invalid("engine.bar_minutes", "must be positive"));
        }
        if self.decision_interval_secs == 0 {
            return Err(invalid("engine.decision_interval_secs", "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopReplaceConfig {
    /// Polls of the open-order list before a new stop counts as unconfirmed.
    pub confirm_attempts: u32,
    pub confirm_delay_ms: u64,
}

impl Default for StopReplaceConfig {
    fn default() -> Self {
        Self {
            confirm_attempts: 3,
            confirm_delay_ms: 200,
        }
    }
}

impl StopReplaceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.confirm_attempts == 0 {
            return Err(invalid("stop_replace.confirm_attempts", "must be at least 1"));
        }
        if u64::from(self.confirm_attempts) * self.confirm_delay_ms > 1_000 {
            return Err(invalid(
                "stop_replace.confirm_delay_ms",
                "confirmation polling must stay within one second",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// With no position left, also cancel reduce-only take-profit orders.
    pub clear_targets_when_flat: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            clear_targets_when_flat: true,
        }
    }
}

// ============================================================================
// Regime detection
// ============================================================================

/// Hysteresis band: switches on above `on`, back off below `off`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisBand {
    pub on: f64,
    pub off: f64,
}

impl HysteresisBand {
    #[must_use]
    pub const fn new(on: f64, off: f64) -> Self {
        Self { on, off }
    }

    /// Next flag state given the previous one.
    #[must_use]
    pub fn step(&self, was_on: bool, value: f64) -> bool {
        if was_on {
            value >= self.off
        } else {
            value >= self.on
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !(self.off < self.on) {
            return Err(invalid(field, format!("off ({}) must be below on ({})", self.off, self.on)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub adx_trend: HysteresisBand,
    /// Base assets that use the major volatility band (matched as symbol prefix).
    pub major_assets: Vec<String>,
    pub major_vol: HysteresisBand,
    pub alt_vol: HysteresisBand,
    pub confirm_bars: u32,
    pub min_hold_bars: u32,
    pub panic_override: bool,
    pub panic_regime: Regime,
    pub panic_confirm_bars: u32,
    /// Consecutive evaluations a new market gate must persist before it applies.
    pub gate_hold_bars: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            adx_trend: HysteresisBand::new(23.0, 19.0),
            major_assets: vec!["BTC".to_string(), "ETH".to_string()],
            major_vol: HysteresisBand::new(1.4, 1.0),
            alt_vol: HysteresisBand::new(2.0, 1.5),
            confirm_bars: 2,
            min_hold_bars: 6,
            panic_override: true,
            panic_regime: Regime::DowntrendHighVol,
            panic_confirm_bars: 1,
            gate_hold_bars: 2,
        }
    }
}

impl RegimeConfig {
    #[must_use]
    pub fn is_major(&self, symbol: &str) -> bool {
        let upper = symbol.to_ascii_uppercase();
        self.major_assets
            .iter()
            .any(|asset| upper.starts_with(&asset.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn vol_band(&self, symbol: &str) -> HysteresisBand {
        if self.is_major(symbol) {
            self.major_vol
        } else {
            self.alt_vol
        }
    }

    /// Confirmations needed before switching to `candidate`.
    #[must_use]
    pub fn required_confirms(&self, candidate: Regime) -> u32 {
        if self.panic_override && candidate == self.panic_regime {
            self.panic_confirm_bars
        } else {
            self.confirm_bars
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.adx_trend.validate("regime.adx_trend")?;
        self.major_vol.validate("regime.major_vol")?;
        self.alt_vol.validate("regime.alt_vol")?;
        if self.confirm_bars == 0 {
            return Err(invalid("regime.confirm_bars", "must be at least 1"));
        }
        if self.panic_override && self.panic_confirm_bars == 0 {
            return Err(invalid("regime.panic_confirm_bars", "must be at least 1"));
        }
        if self.gate_hold_bars == 0 {
            return Err(invalid("regime.gate_hold_bars", "must be at least 1"));
        }
        Ok(())
    }
}

/// Trading permissions for one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSettings {
    pub trade_enabled: bool,
    pub mode: String,
    pub position_scale: f64,
    pub leverage_cap: u32,
}

impl RegimeSettings {
    fn new(trade_enabled: bool, mode: &str, position_scale: f64, leverage_cap: u32) -> Self {
        Self {
            trade_enabled,
            mode: mode.to_string(),
            position_scale,
            leverage_cap,
        }
    }
}

/// Multiplicative overlay applied by a defensive market gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateModifier {
    pub scale_mult: f64,
    pub leverage_cap: Option<u32>,
    pub new_long_enabled: bool,
    /// Multiplier on trailing distances; below 1 tightens stops.
    pub sl_tighten_mult: f64,
    pub force_trailing_tighten: bool,
}

impl Default for GateModifier {
    fn default() -> Self {
        Self {
            scale_mult: 1.0,
            leverage_cap: None,
            new_long_enabled: true,
            sl_tighten_mult: 1.0,
            force_trailing_tighten: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSettingsConfig {
    pub range_lowvol: RegimeSettings,
    pub range_highvol: RegimeSettings,
    pub uptrend_lowvol: RegimeSettings,
    pub uptrend_highvol: RegimeSettings,
    pub downtrend_lowvol: RegimeSettings,
    pub downtrend_highvol: RegimeSettings,
    pub riskoff: GateModifier,
    pub panic: GateModifier,
}

impl Default for RegimeSettingsConfig {
    fn default() -> Self {
        Self {
            range_lowvol: RegimeSettings::new(true, "mean_reversion_light", 0.5, 3),
            range_highvol: RegimeSettings::new(false, "protect", 0.35, 3),
            uptrend_lowvol: RegimeSettings::new(true, "trend_pullback", 1.0, 5),
            uptrend_highvol: RegimeSettings::new(true, "breakout_trend", 0.7, 3),
            downtrend_lowvol: RegimeSettings::new(true, "trend_pullback_short", 0.7, 3),
            downtrend_highvol: RegimeSettings::new(
                true,
                "panic_defense_or_momentum_short",
                0.35,
                2,
            ),
            riskoff: GateModifier {
                scale_mult: 0.7,
                ..GateModifier::default()
            },
            panic: GateModifier {
                scale_mult: 0.5,
                leverage_cap: Some(2),
                new_long_enabled: false,
                sl_tighten_mult: 0.8,
                force_trailing_tighten: true,
            },
        }
    }
}

impl RegimeSettingsConfig {
    #[must_use]
    pub const fn for_regime(&self, regime: Regime) -> &RegimeSettings {
        match regime {
            Regime::RangeLowVol => &self.range_lowvol,
            Regime::RangeHighVol => &self.range_highvol,
            Regime::UptrendLowVol => &self.uptrend_lowvol,
            Regime::UptrendHighVol => &self.uptrend_highvol,
            Regime::DowntrendLowVol => &self.downtrend_lowvol,
            Regime::DowntrendHighVol => &self.downtrend_highvol,
        }
    }

    /// Overlay for `gate`, or `None` under NORMAL.
    #[must_use]
    pub const fn modifier(&self, gate: MarketGate) -> Option<&GateModifier> {
        match gate {
            MarketGate::Normal => None,
            MarketGate::RiskOff => Some(&self.riskoff),
            MarketGate::Panic => Some(&self.panic),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for regime in Regime::ALL {
            let s = self.for_regime(regime);
            if !(s.position_scale > 0.0 && s.position_scale <= 1.0) {
                return Err(invalid(
                    "regime_settings.position_scale",
                    format!("{regime}: {} not in (0, 1]", s.position_scale),
                ));
            }
            if s.leverage_cap == 0 {
                return Err(invalid(
                    "regime_settings.leverage_cap",
                    format!("{regime}: must be at least 1"),
                ));
            }
        }
        for (name, m) in [("riskoff", &self.riskoff), ("panic", &self.panic)] {
            if !(m.scale_mult > 0.0 && m.scale_mult <= 1.0) {
                return Err(invalid(
                    "regime_settings.scale_mult",
                    format!("{name}: {} not in (0, 1]", m.scale_mult),
                ));
            }
            if !(m.sl_tighten_mult > 0.0 && m.sl_tighten_mult <= 1.0) {
                return Err(invalid(
                    "regime_settings.sl_tighten_mult",
                    format!("{name}: {} not in (0, 1]", m.sl_tighten_mult),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Portfolio risk
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioRiskConfig {
    /// Fraction of equity risked per trade at full scale.
    pub risk_per_trade_pct: Decimal,
    /// Equity drawdown from the day-start baseline that trips the breaker.
    pub daily_loss_limit_pct: Decimal,
    pub max_consecutive_losses: u32,
    pub cooldown_bars: u32,
    pub max_positions_total: usize,
    /// Replaces `max_positions_total` under RISKOFF and PANIC.
    pub defensive_max_positions: usize,
    pub max_longs: usize,
    pub max_shorts: usize,
    pub max_new_entries_per_bar: u32,
    pub execution_failure_limit: u32,
    pub leverage_cap_low_vol: u32,
    pub leverage_cap_high_vol: u32,
    pub leverage_cap_panic: u32,
}

impl Default for PortfolioRiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: Decimal::new(35, 4),
            daily_loss_limit_pct: Decimal::new(2, 2),
            max_consecutive_losses: 3,
            cooldown_bars: 6,
            max_positions_total: 2,
            defensive_max_positions: 1,
            max_longs: 2,
            max_shorts: 2,
            max_new_entries_per_bar: 1,
            execution_failure_limit: 3,
            leverage_cap_low_vol: 5,
            leverage_cap_high_vol: 3,
            leverage_cap_panic: 2,
        }
    }
}

impl PortfolioRiskConfig {
    #[must_use]
    pub fn with_max_new_entries_per_bar(mut self, n: u32) -> Self {
        self.max_new_entries_per_bar = n;
        self
    }

    #[must_use]
    pub fn with_max_positions_total(mut self, n: usize) -> Self {
        self.max_positions_total = n;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let one = Decimal::ONE;
        if self.risk_per_trade_pct <= Decimal::ZERO || self.risk_per_trade_pct > one {
            return Err(invalid("portfolio.risk_per_trade_pct", "must be in (0, 1]"));
        }
        if self.daily_loss_limit_pct <= Decimal::ZERO || self.daily_loss_limit_pct > one {
            return Err(invalid("portfolio.daily_loss_limit_pct", "must be in (0, 1]"));
        }
        if self.defensive_max_positions > self.max_positions_total {
            return Err(invalid(
                "portfolio.defensive_max_positions",
                "must not exceed max_positions_total",
            ));
        }
        if self.execution_failure_limit == 0 {
            return Err(invalid("portfolio.execution_failure_limit", "must be at least 1"));
        }
        if self.leverage_cap_panic == 0 || self.leverage_cap_high_vol == 0 || self.leverage_cap_low_vol == 0 {
            return Err(invalid("portfolio.leverage_cap", "caps must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Candidate scoring
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub trend: f64,
    pub direction: f64,
    pub volatility: f64,
    pub liquidity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            trend: 0.35,
            direction: 0.25,
            volatility: 0.20,
            liquidity: 0.20,
        }
    }
}

impl ScoreWeights {
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.trend + self.direction + self.volatility + self.liquidity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub max_atr_pct: f64,
    /// Bid/ask spread ceiling, in percent of mid.
    pub max_spread_pct: f64,
    pub max_abs_funding: f64,
    pub min_quote_volume: f64,
    pub adx_cap: f64,
    pub vol_sweet_low: f64,
    pub vol_sweet_high: f64,
    /// Score lost per ATR% point above the sweet spot.
    pub vol_falloff: f64,
    pub liquidity_rank_step: f64,
    pub weights: ScoreWeights,
    pub same_direction_limit: usize,
    pub same_direction_penalty: f64,
    /// Base assets that move with the benchmark.
    pub benchmark_cluster: Vec<String>,
    pub cluster_penalty: f64,
    pub top_n: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            max_atr_pct: 4.5,
            max_spread_pct: 0.10,
            max_abs_funding: 0.0003,
            min_quote_volume: 1_000_000.0,
            adx_cap: 40.0,
            vol_sweet_low: 1.2,
            vol_sweet_high: 2.5,
            vol_falloff: 40.0,
            liquidity_rank_step: 2.0,
            weights: ScoreWeights::default(),
            same_direction_limit: 2,
            same_direction_penalty: 0.5,
            benchmark_cluster: [
                "ETH", "SOL", "BNB", "XRP", "ADA", "AVAX", "LINK", "DOT", "MATIC", "NEAR", "APT",
                "ARB",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            cluster_penalty: 0.7,
            top_n: 5,
        }
    }
}

impl ScorerConfig {
    #[must_use]
    pub fn in_benchmark_cluster(&self, symbol: &str) -> bool {
        let upper = symbol.to_ascii_uppercase();
        self.benchmark_cluster
            .iter()
            .any(|asset| upper.starts_with(&asset.to_ascii_uppercase()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if (self.weights.sum() - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "scorer.weights",
                format!("must sum to 1.0, got {}", self.weights.sum()),
            ));
        }
        if !(self.vol_sweet_low > 0.0 && self.vol_sweet_low < self.vol_sweet_high) {
            return Err(invalid("scorer.vol_sweet_low", "must be positive and below vol_sweet_high"));
        }
        if self.adx_cap <= 0.0 {
            return Err(invalid("scorer.adx_cap", "must be positive"));
        }
        for (field, v) in [
            ("scorer.same_direction_penalty", self.same_direction_penalty),
            ("scorer.cluster_penalty", self.cluster_penalty),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(invalid(field, "must be in (0, 1]"));
            }
        }
        if self.top_n == 0 {
            return Err(invalid("scorer.top_n", "must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Position lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeCutMode {
    Candles,
    Minutes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeCutConfig {
    pub enabled: bool,
    pub mode: TimeCutMode,
    pub max_candles: u32,
    pub max_minutes: i64,
    /// Positions at or above this return are never time-cut.
    pub min_profit_roi: Decimal,
}

impl Default for TimeCutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TimeCutMode::Candles,
            max_candles: 10,
            max_minutes: 240,
            min_profit_roi: Decimal::new(5, 3),
        }
    }
}

/// Staged exits. All thresholds are returns on entry (0.012 = 1.2%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub tp1_roi: Decimal,
    pub tp1_ratio: Decimal,
    pub breakeven_buffer: Decimal,
    pub early_defense_trigger: Decimal,
    pub early_defense_stop: Decimal,
    pub tp2_roi: Decimal,
    /// Fraction of the original size closed at TP2.
    pub tp2_ratio: Decimal,
    pub tp2_max_ratio: Decimal,
    pub tp3_roi: Decimal,
    pub trail_start_roi: Decimal,
    pub trail_step_roi: Decimal,
    pub trail_wide_roi: Decimal,
    pub trail_atr_mult_near: Decimal,
    pub trail_atr_mult_far: Decimal,
    pub trail_fallback_pct: Decimal,
    pub fuse_stop_pct: Decimal,
    /// Estimated taker fee per side, used when booking closed trades.
    pub fee_rate: Decimal,
    pub time_cut: TimeCutConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tp1_roi: Decimal::new(12, 3),
            tp1_ratio: Decimal::new(4, 1),
            breakeven_buffer: Decimal::new(15, 4),
            early_defense_trigger: Decimal::new(6, 3),
            early_defense_stop: Decimal::new(6, 3),
            tp2_roi: Decimal::new(25, 3),
            tp2_ratio: Decimal::new(3, 1),
            tp2_max_ratio: Decimal::new(5, 1),
            tp3_roi: Decimal::new(45, 3),
            trail_start_roi: Decimal::new(25, 3),
            trail_step_roi: Decimal::new(2, 3),
            trail_wide_roi: Decimal::new(2, 2),
            trail_atr_mult_near: Decimal::new(15, 1),
            trail_atr_mult_far: Decimal::new(25, 1),
            trail_fallback_pct: Decimal::new(15, 3),
            fuse_stop_pct: Decimal::new(3, 3),
            fee_rate: Decimal::new(4, 4),
            time_cut: TimeCutConfig::default(),
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let zero = Decimal::ZERO;
        let one = Decimal::ONE;
        if !(zero < self.tp1_roi && self.tp1_roi < self.tp2_roi && self.tp2_roi <= self.tp3_roi) {
            return Err(invalid("lifecycle.tp_roi", "require 0 < tp1 < tp2 <= tp3"));
        }
        for (field, ratio) in [
            ("lifecycle.tp1_ratio", self.tp1_ratio),
            ("lifecycle.tp2_ratio", self.tp2_ratio),
            ("lifecycle.tp2_max_ratio", self.tp2_max_ratio),
        ] {
            if ratio <= zero || ratio > one {
                return Err(invalid(field, "must be in (0, 1]"));
            }
        }
        if self.tp1_ratio >= one {
            return Err(invalid("lifecycle.tp1_ratio", "must leave a remainder"));
        }
        if self.trail_step_roi <= zero || self.trail_fallback_pct <= zero {
            return Err(invalid("lifecycle.trail", "step and fallback must be positive"));
        }
        if self.fee_rate < zero {
            return Err(invalid("lifecycle.fee_rate", "must not be negative"));
        }
        if self.early_defense_trigger >= self.tp1_roi {
            return Err(invalid("lifecycle.early_defense_trigger", "must be below tp1_roi"));
        }
        Ok(())
    }
}

// ============================================================================
// Entry gate
// ============================================================================

/// Local-time hour window, `start` inclusive and `end` exclusive. Wraps past midnight
/// when `end <= start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    #[must_use]
    pub const fn contains(&self, hour: u32) -> bool {
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryGateConfig {
    pub enabled: bool,
    /// IANA timezone the trading day is counted in.
    pub timezone: String,
    pub max_trades_per_day: u32,
    pub min_minutes_between: i64,
    pub require_new_setup: bool,
    pub allow_hours: Option<HourWindow>,
}

impl Default for EntryGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "Asia/Seoul".to_string(),
            max_trades_per_day: 2,
            min_minutes_between: 360,
            require_new_setup: true,
            allow_hours: None,
        }
    }
}

impl EntryGateConfig {
    /// # Errors
    /// Returns [`ConfigError::Timezone`] for a name chrono-tz does not know.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        if self.min_minutes_between < 0 {
            return Err(invalid("entry_gate.min_minutes_between", "must not be negative"));
        }
        if let Some(w) = self.allow_hours {
            if w.start > 23 || w.end > 24 {
                return Err(invalid("entry_gate.allow_hours", "hours must be within 0..=24"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Crash fuse and fee guard
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub enabled: bool,
    /// Minimum drop from the bar open that counts as a crash (0.008 = 0.8%).
    pub min_drop_pct: f64,
    /// Threshold also scales with the short-timeframe ATR%.
    pub atr_mult: f64,
    /// Cycles the fuse stays active after the last trigger.
    pub hold_cycles: u32,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_drop_pct: 0.008,
            atr_mult: 0.8,
            hold_cycles: 3,
        }
    }
}

impl FuseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_drop_pct <= 0.0 || self.atr_mult < 0.0 {
            return Err(invalid("fuse.min_drop_pct", "drop must be positive, multiplier non-negative"));
        }
        Ok(())
    }
}

/// How fee burden is measured against trading results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRatioFormula {
    /// sum |fee| / sum |pnl|
    #[default]
    AbsPnl,
    /// sum |fee| / sum of winning pnl
    GrossProfit,
    /// sum |fee| / |sum pnl|
    NetPnl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeGuardConfig {
    pub enabled: bool,
    pub window: usize,
    pub min_trades: usize,
    pub max_ratio: Decimal,
    pub formula: FeeRatioFormula,
}

impl Default for FeeGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 10,
            min_trades: 3,
            max_ratio: Decimal::new(30, 2),
            formula: FeeRatioFormula::AbsPnl,
        }
    }
}

impl FeeGuardConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 || self.min_trades > self.window {
            return Err(invalid("fee_guard.window", "window must be positive and >= min_trades"));
        }
        if self.max_ratio <= Decimal::ZERO {
            return Err(invalid("fee_guard.max_ratio", "must be positive"));
        }
        Ok(())
    }
}
