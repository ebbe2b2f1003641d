//! Regime classification with hysteresis and confirmation.
//!
//! Each instrument gets three hysteresis-gated axes (trend strength, volatility,
//! direction) combined into one of six regimes. A raw regime change only takes
//! effect after `confirm_bars` sightings and `min_hold_bars` of tenure; the
//! market gate derived from the benchmark has its own hold requirement.

use riskgate_core::config::{RegimeConfig, RegimeSettingsConfig};
use riskgate_core::{MarketGate, MarketSnapshot, Regime, RegimeView, TrendDirection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Per-instrument stabilization state. Lives for the whole process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeState {
    pub current: Option<Regime>,
    pub pending: Option<Regime>,
    pub confirm_count: u32,
    pub hold_count: u32,
    pub trend_on: bool,
    pub high_vol: bool,
}

impl RegimeState {
    /// State already settled on `regime`, as if observed once.
    #[must_use]
    pub fn settled(regime: Regime) -> Self {
        Self {
            current: Some(regime),
            hold_count: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegimeReading {
    pub symbol: String,
    /// Stabilized regime.
    pub regime: Regime,
    /// Regime the indicators point at this cycle.
    pub raw: Regime,
    pub changed: bool,
    pub trend_on: bool,
    pub high_vol: bool,
    pub direction: TrendDirection,
}

/// Direction from the fast/slow EMA relationship and the fast EMA's slope.
#[must_use]
pub fn trend_direction(ema_fast: f64, ema_slow: f64, fast_slope: f64) -> TrendDirection {
    if ema_fast > ema_slow && fast_slope > 0.0 {
        TrendDirection::Up
    } else if ema_fast < ema_slow && fast_slope < 0.0 {
        TrendDirection::Down
    } else {
        TrendDirection::Range
    }
}

/// Applies one raw observation to `state`. Returns the stabilized regime and
/// whether it switched this cycle.
///
/// The first observation counts as one bar held; the bar that completes a
/// switch does not.
pub fn stabilize(state: &mut RegimeState, raw: Regime, config: &RegimeConfig) -> (Regime, bool) {
    let Some(current) = state.current else {
        state.current = Some(raw);
        state.pending = None;
        state.confirm_count = 0;
        state.hold_count = 1;
        return (raw, false);
    };

    if raw == current {
        state.pending = None;
        state.confirm_count = 0;
        state.hold_count += 1;
        return (current, false);
    }

    if state.pending == Some(raw) {
        state.confirm_count += 1;
    } else {
        state.pending = Some(raw);
        state.confirm_count = 1;
    }

    if state.confirm_count >= config.required_confirms(raw) && state.hold_count >= config.min_hold_bars {
        state.current = Some(raw);
        state.pending = None;
        state.confirm_count = 0;
        state.hold_count = 0;
        return (raw, true);
    }

    state.hold_count += 1;
    (current, false)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketGateState {
    pub status: MarketGate,
    pub candidate: Option<MarketGate>,
    pub hold_count: u32,
    pub initialized: bool,
}

impl MarketGateState {
    /// Feeds the benchmark's stabilized regime. Returns the gate and whether it
    /// switched this cycle.
    pub fn update(&mut self, benchmark_regime: Regime, hold_bars: u32) -> (MarketGate, bool) {
        let observed = MarketGate::from_regime(benchmark_regime);
        if !self.initialized {
            self.initialized = true;
            self.status = observed;
            return (observed, false);
        }
        if observed == self.status {
            self.candidate = None;
            self.hold_count = 0;
            return (self.status, false);
        }
        if self.candidate == Some(observed) {
            self.hold_count += 1;
        } else {
            self.candidate = Some(observed);
            self.hold_count = 1;
        }
        if self.hold_count >= hold_bars {
            self.status = observed;
            self.candidate = None;
            self.hold_count = 0;
            return (observed, true);
        }
        (self.status, false)
    }
}

/// Regime settings after the market gate overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveSettings {
    pub regime: Regime,
    pub gate: MarketGate,
    pub trade_enabled: bool,
    pub mode: String,
    pub position_scale: f64,
    pub leverage_cap: u32,
    pub new_long_enabled: bool,
    pub sl_tighten_mult: f64,
    pub force_trailing_tighten: bool,
}

impl EffectiveSettings {
    #[must_use]
    pub fn resolve(table: &RegimeSettingsConfig, regime: Regime, gate: MarketGate) -> Self {
        let base = table.for_regime(regime);
        let mut out = Self {
            regime,
            gate,
            trade_enabled: base.trade_enabled,
            mode: base.mode.clone(),
            position_scale: base.position_scale,
            leverage_cap: base.leverage_cap,
            new_long_enabled: true,
            sl_tighten_mult: 1.0,
            force_trailing_tighten: false,
        };
        if let Some(m) = table.modifier(gate) {
            out.position_scale *= m.scale_mult;
            if let Some(cap) = m.leverage_cap {
                out.leverage_cap = out.leverage_cap.min(cap);
            }
            out.new_long_enabled = m.new_long_enabled;
            out.sl_tighten_mult = m.sl_tighten_mult;
            out.force_trailing_tighten = m.force_trailing_tighten;
        }
        out
    }

    #[must_use]
    pub fn view(&self) -> RegimeView {
        RegimeView {
            regime: self.regime,
            gate: self.gate,
            mode: self.mode.clone(),
            new_long_enabled: self.new_long_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReading {
    pub benchmark: RegimeReading,
    pub gate: MarketGate,
    pub changed: bool,
}

/// Regime and market-gate tracker for the whole universe.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    config: RegimeConfig,
    states: HashMap<String, RegimeState>,
    gate: MarketGateState,
}

impl RegimeDetector {
    #[must_use]
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            gate: MarketGateState::default(),
        }
    }

    /// Computes the raw regime from a snapshot, advancing the hysteresis flags.
    fn raw_regime(&self, state: &mut RegimeState, snapshot: &MarketSnapshot) -> (Regime, TrendDirection) {
        state.trend_on = self.config.adx_trend.step(state.trend_on, snapshot.adx);
        state.high_vol = self
            .config
            .vol_band(&snapshot.symbol)
            .step(state.high_vol, snapshot.atr_pct);
        let direction = trend_direction(snapshot.ema_fast, snapshot.ema_slow, snapshot.ema_fast_slope);
        let axis = if state.trend_on { direction } else { TrendDirection::Range };
        (Regime::from_axes(axis, state.high_vol), direction)
    }

    pub fn observe(&mut self, snapshot: &MarketSnapshot) -> RegimeReading {
        let mut state = self.states.remove(&snapshot.symbol).unwrap_or_default();
        let (raw, direction) = self.raw_regime(&mut state, snapshot);
        let previous = state.current;
        let (regime, changed) = stabilize(&mut state, raw, &self.config);
        if changed {
            info!(
                symbol = %snapshot.symbol,
                from = ?previous,
                to = %regime,
                "regime changed"
            );
        }
        let reading = RegimeReading {
            symbol: snapshot.symbol.clone(),
            regime,
            raw,
            changed,
            trend_on: state.trend_on,
            high_vol: state.high_vol,
            direction,
        };
        self.states.insert(snapshot.symbol.clone(), state);
        reading
    }

    /// Feeds an already classified raw regime.
    pub fn observe_raw(&mut self, symbol: &str, raw: Regime) -> (Regime, bool) {
        let state = self.states.entry(symbol.to_string()).or_default();
        stabilize(state, raw, &self.config)
    }

    /// Observes the benchmark and advances the market gate.
    pub fn observe_benchmark(&mut self, snapshot: &MarketSnapshot) -> GateReading {
        let benchmark = self.observe(snapshot);
        let previous = self.gate.status;
        let (gate, changed) = self.gate.update(benchmark.regime, self.config.gate_hold_bars);
        if changed {
            info!(from = %previous, to = %gate, benchmark = %benchmark.regime, "market gate changed");
        }
        GateReading {
            benchmark,
            gate,
            changed,
        }
    }

    #[must_use]
    pub fn gate(&self) -> MarketGate {
        self.gate.status
    }

    #[must_use]
    pub fn gate_state(&self) -> MarketGateState {
        self.gate.clone()
    }

    #[must_use]
    pub fn current(&self, symbol: &str) -> Option<Regime> {
        self.states.get(symbol).and_then(|s| s.current)
    }

    #[must_use]
    pub fn state(&self, symbol: &str) -> Option<RegimeState> {
        self.states.get(symbol).cloned()
    }

    /// Current regime of every observed symbol.
    #[must_use]
    pub fn regimes(&self) -> HashMap<String, Regime> {
        self.states
            .iter()
            .filter_map(|(symbol, s)| s.current.map(|r| (symbol.clone(), r)))
            .collect()
    }

    #[must_use]
    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, adx: f64, atr_pct: f64, fast: f64, slow: f64, slope: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.into(),
            bar_time: Utc::now(),
            close: dec!(100),
            adx,
            atr: atr_pct,
            atr_pct,
            ema_fast: fast,
            ema_slow: slow,
            ema_fast_slope: slope,
            rsi: 50.0,
            bb_width: 0.02,
            vol_spike_mult: 1.0,
            volume_rank: 0,
        }
    }

    fn config(confirm: u32, hold: u32) -> RegimeConfig {
        RegimeConfig {
            confirm_bars: confirm,
            min_hold_bars: hold,
            ..RegimeConfig::default()
        }
    }

    #[test]
    fn test_confirmation_sequence() {
        let cfg = config(2, 0);
        let mut state = RegimeState::settled(Regime::RangeLowVol);
        let seq = [
            Regime::RangeLowVol,
            Regime::UptrendLowVol,
            Regime::UptrendLowVol,
            Regime::UptrendLowVol,
        ];
        let out: Vec<Regime> = seq.iter().map(|r| stabilize(&mut state, *r, &cfg).0).collect();
        assert_eq!(
            out,
            vec![
                Regime::RangeLowVol,
                Regime::RangeLowVol,
                Regime::UptrendLowVol,
                Regime::UptrendLowVol
            ]
        );
    }

    #[test]
    fn test_min_hold_delays_switch() {
        let cfg = config(1, 3);
        let mut state = RegimeState::settled(Regime::RangeLowVol);
        let mut switched_at = None;
        for cycle in 1..=5 {
            let (_, changed) = stabilize(&mut state, Regime::UptrendLowVol, &cfg);
            if changed {
                switched_at = Some(cycle);
                break;
            }
        }
        // hold 1,2 while pending, switch once hold reaches 3
        assert_eq!(switched_at, Some(3));
    }

    #[test]
    fn test_first_observation_counts_as_held() {
        let cfg = config(1, 2);
        let mut state = RegimeState::default();
        assert_eq!(stabilize(&mut state, Regime::RangeLowVol, &cfg), (Regime::RangeLowVol, false));
        assert_eq!(state.hold_count, 1);
        assert_eq!(stabilize(&mut state, Regime::UptrendLowVol, &cfg), (Regime::RangeLowVol, false));
        assert_eq!(stabilize(&mut state, Regime::UptrendLowVol, &cfg), (Regime::UptrendLowVol, true));
        // after a switch the tenure starts from zero
        assert_eq!(state.hold_count, 0);
        assert!(!stabilize(&mut state, Regime::RangeLowVol, &cfg).1);
        assert!(!stabilize(&mut state, Regime::RangeLowVol, &cfg).1);
        assert!(stabilize(&mut state, Regime::RangeLowVol, &cfg).1);
    }

    #[test]
    fn test_panic_regime_confirms_faster() {
        let cfg = config(3, 0);
        let mut state = RegimeState::settled(Regime::UptrendLowVol);
        let (regime, changed) = stabilize(&mut state, Regime::DowntrendHighVol, &cfg);
        assert!(changed);
        assert_eq!(regime, Regime::DowntrendHighVol);

        let mut state = RegimeState::settled(Regime::UptrendLowVol);
        assert!(!stabilize(&mut state, Regime::DowntrendLowVol, &cfg).1);
    }

    #[test]
    fn test_interrupted_pending_resets_confirmations() {
        let cfg = config(2, 0);
        let mut state = RegimeState::settled(Regime::RangeLowVol);
        stabilize(&mut state, Regime::UptrendLowVol, &cfg);
        stabilize(&mut state, Regime::RangeLowVol, &cfg);
        let (regime, changed) = stabilize(&mut state, Regime::UptrendLowVol, &cfg);
        assert!(!changed);
        assert_eq!(regime, Regime::RangeLowVol);
        assert_eq!(state.confirm_count, 1);
    }

    #[test]
    fn test_trend_hysteresis_holds_between_thresholds() {
        let mut detector = RegimeDetector::new(config(1, 0));
        // adx 25 turns trend on
        let r = detector.observe(&snapshot("SOLUSDT", 25.0, 1.0, 105.0, 100.0, 0.5));
        assert!(r.trend_on);
        assert_eq!(r.regime, Regime::UptrendLowVol);
        // adx 21 is between off (19) and on (23): stays on
        let r = detector.observe(&snapshot("SOLUSDT", 21.0, 1.0, 105.0, 100.0, 0.5));
        assert!(r.trend_on);
        // adx 18 drops it
        let r = detector.observe(&snapshot("SOLUSDT", 18.0, 1.0, 105.0, 100.0, 0.5));
        assert!(!r.trend_on);
        assert_eq!(r.raw, Regime::RangeLowVol);
    }

    #[test]
    fn test_major_and_alt_volatility_bands_differ() {
        let mut detector = RegimeDetector::new(config(1, 0));
        let btc = detector.observe(&snapshot("BTCUSDT", 10.0, 1.6, 100.0, 100.0, 0.0));
        let sol = detector.observe(&snapshot("SOLUSDT", 10.0, 1.6, 100.0, 100.0, 0.0));
        assert!(btc.high_vol);
        assert!(!sol.high_vol);
    }

    #[test]
    fn test_trend_without_direction_is_range() {
        let mut detector = RegimeDetector::new(config(1, 0));
        // fast above slow but falling slope
        let r = detector.observe(&snapshot("SOLUSDT", 30.0, 2.5, 105.0, 100.0, -0.2));
        assert_eq!(r.direction, TrendDirection::Range);
        assert_eq!(r.regime, Regime::RangeHighVol);
    }

    #[test]
    fn test_gate_requires_two_cycles() {
        let mut gate = MarketGateState::default();
        assert_eq!(gate.update(Regime::UptrendLowVol, 2), (MarketGate::Normal, false));
        assert_eq!(gate.update(Regime::DowntrendHighVol, 2), (MarketGate::Normal, false));
        assert_eq!(gate.update(Regime::DowntrendHighVol, 2), (MarketGate::Panic, true));
        // a single normal reading does not lift it
        assert_eq!(gate.update(Regime::UptrendLowVol, 2), (MarketGate::Panic, false));
        assert_eq!(gate.update(Regime::DowntrendHighVol, 2), (MarketGate::Panic, false));
        assert_eq!(gate.hold_count, 0);
    }

    #[test]
    fn test_gate_candidate_switch_restarts_hold() {
        let mut gate = MarketGateState::default();
        gate.update(Regime::UptrendLowVol, 2);
        gate.update(Regime::RangeHighVol, 2);
        assert_eq!(gate.update(Regime::DowntrendHighVol, 2), (MarketGate::Normal, false));
        assert_eq!(gate.update(Regime::DowntrendHighVol, 2), (MarketGate::Panic, true));
    }

    #[test]
    fn test_effective_settings_under_panic() {
        let table = RegimeSettingsConfig::default();
        let s = EffectiveSettings::resolve(&table, Regime::UptrendLowVol, MarketGate::Panic);
        assert!((s.position_scale - 0.5).abs() < 1e-12);
        assert_eq!(s.leverage_cap, 2);
        assert!(!s.new_long_enabled);
        assert!(s.force_trailing_tighten);

        let r = EffectiveSettings::resolve(&table, Regime::UptrendLowVol, MarketGate::RiskOff);
        assert!((r.position_scale - 0.7).abs() < 1e-12);
        assert_eq!(r.leverage_cap, 5);
        assert!(r.new_long_enabled);

        let n = EffectiveSettings::resolve(&table, Regime::RangeHighVol, MarketGate::Normal);
        assert!(!n.trade_enabled);
        assert_eq!(n.view().mode, "protect");
    }

    #[test]
    fn test_benchmark_drives_gate() {
        let mut detector = RegimeDetector::new(RegimeConfig {
            min_hold_bars: 0,
            ..RegimeConfig::default()
        });
        let calm = snapshot("BTCUSDT", 30.0, 0.8, 105.0, 100.0, 1.0);
        let crash = snapshot("BTCUSDT", 30.0, 2.0, 95.0, 100.0, -1.0);
        assert_eq!(detector.observe_benchmark(&calm).gate, MarketGate::Normal);
        // panic regime confirms in one bar, the gate still needs two
        let first = detector.observe_benchmark(&crash);
        assert_eq!(first.benchmark.regime, Regime::DowntrendHighVol);
        assert_eq!(first.gate, MarketGate::Normal);
        let second = detector.observe_benchmark(&crash);
        assert!(second.changed);
        assert_eq!(detector.gate(), MarketGate::Panic);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn regime_strategy() -> impl Strategy<Value = Regime> {
            (0usize..6).prop_map(|i| Regime::ALL[i])
        }

        /// Cycle indices at which the stabilized regime switched.
        fn change_cycles(cfg: &RegimeConfig, seq: &[Regime]) -> Vec<usize> {
            let mut state = RegimeState::default();
            seq.iter()
                .enumerate()
                .filter_map(|(i, r)| stabilize(&mut state, *r, cfg).1.then_some(i))
                .collect()
        }

        proptest! {
            #[test]
            fn oscillation_switches_at_most_once_per_window(
                confirm in 1u32..5,
                hold in 0u32..8,
                a in regime_strategy(),
                b in regime_strategy(),
                len in 2usize..60,
            ) {
                let cfg = RegimeConfig { confirm_bars: confirm, min_hold_bars: hold, panic_override: false, ..RegimeConfig::default() };
                let seq: Vec<Regime> = (0..len).map(|i| if i % 2 == 0 { a } else { b }).collect();
                let changes = change_cycles(&cfg, &seq);
                let window = confirm.max(hold) as usize;
                let mut last = 0usize;
                for c in changes {
                    prop_assert!(c - last >= window.max(1));
                    last = c;
                }
            }

            #[test]
            fn arbitrary_sequences_respect_the_double_gate(
                confirm in 1u32..4,
                hold in 0u32..6,
                panic_override in any::<bool>(),
                seq in proptest::collection::vec(regime_strategy(), 1..80),
            ) {
                let cfg = RegimeConfig {
                    confirm_bars: confirm,
                    min_hold_bars: hold,
                    panic_override,
                    panic_confirm_bars: 1,
                    ..RegimeConfig::default()
                };
                let fastest = if panic_override { 1 } else { confirm };
                // the first observation already counts toward the hold
                let first_window = fastest.max(hold) as usize;
                let window = fastest.max(hold + 1) as usize;
                let mut last: Option<usize> = None;
                for c in change_cycles(&cfg, &seq) {
                    match last {
                        None => prop_assert!(c >= first_window),
                        Some(l) => prop_assert!(c - l >= window),
                    }
                    last = Some(c);
                }
            }
        }
    }
}
