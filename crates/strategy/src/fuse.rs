//! Benchmark crash fuse.

use riskgate_core::config::FuseConfig;
use riskgate_core::FuseBar;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FuseStatus {
    pub active: bool,
    pub remaining_cycles: u32,
    /// Drop of the last evaluated bar, as a negative fraction.
    pub last_drop: Option<f64>,
    pub threshold: Option<f64>,
}

/// Trips when the benchmark's current bar falls from its open by more than
/// `max(min_drop_pct, atr_mult × atr_pct)` and stays active for `hold_cycles`
/// further evaluations.
#[derive(Debug, Clone)]
pub struct CrashFuse {
    config: FuseConfig,
    status: FuseStatus,
}

impl CrashFuse {
    #[must_use]
    pub fn new(config: FuseConfig) -> Self {
        Self {
            config,
            status: FuseStatus::default(),
        }
    }

    #[must_use]
    pub fn threshold(&self, atr_pct: f64) -> f64 {
        let scaled = if atr_pct.is_finite() { self.config.atr_mult * atr_pct } else { 0.0 };
        self.config.min_drop_pct.max(scaled)
    }

    /// Feeds this cycle's bar (or `None` when unavailable) and returns whether
    /// the fuse is active.
    pub fn evaluate(&mut self, bar: Option<&FuseBar>) -> bool {
        if !self.config.enabled {
            return false;
        }

        let triggered = bar.is_some_and(|bar| self.crashed(bar));
        if triggered {
            if !self.status.active {
                warn!(
                    drop = ?self.status.last_drop,
                    threshold = ?self.status.threshold,
                    "Benchmark crash detected, fuse active"
                );
            }
            self.status.remaining_cycles = self.config.hold_cycles;
            self.status.active = true;
        } else if self.status.remaining_cycles > 0 {
            self.status.remaining_cycles -= 1;
            self.status.active = true;
        } else {
            if self.status.active {
                info!("Crash fuse released");
            }
            self.status.active = false;
        }
        self.status.active
    }

    fn crashed(&mut self, bar: &FuseBar) -> bool {
        if bar.open <= Decimal::ZERO {
            return false;
        }
        let Some(drop) = ((bar.last - bar.open) / bar.open).to_f64() else {
            return false;
        };
        let threshold = self.threshold(bar.atr_pct);
        self.status.last_drop = Some(drop);
        self.status.threshold = Some(threshold);
        drop <= -threshold
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.active
    }

    #[must_use]
    pub fn status(&self) -> FuseStatus {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open: Decimal, last: Decimal, atr_pct: f64) -> FuseBar {
        FuseBar { open, last, atr_pct }
    }

    #[test]
    fn test_threshold_floor_and_atr_scaling() {
        let fuse = CrashFuse::new(FuseConfig::default());
        assert!((fuse.threshold(0.005) - 0.008).abs() < 1e-12);
        assert!((fuse.threshold(0.02) - 0.016).abs() < 1e-12);
    }

    #[test]
    fn test_small_drop_does_not_trip() {
        let mut fuse = CrashFuse::new(FuseConfig::default());
        assert!(!fuse.evaluate(Some(&bar(dec!(100), dec!(99.5), 0.004))));
        let drop = fuse.status().last_drop.unwrap();
        assert!((drop + 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_crash_holds_for_configured_cycles() {
        let mut fuse = CrashFuse::new(FuseConfig::default());
        assert!(fuse.evaluate(Some(&bar(dec!(100), dec!(99), 0.004))));
        let calm = bar(dec!(99), dec!(99.1), 0.004);
        assert!(fuse.evaluate(Some(&calm)));
        assert!(fuse.evaluate(Some(&calm)));
        assert!(fuse.evaluate(None));
        assert!(!fuse.evaluate(Some(&calm)));
    }

    #[test]
    fn test_high_volatility_raises_the_bar() {
        let mut fuse = CrashFuse::new(FuseConfig::default());
        // 1% drop against a 1.6% threshold
        assert!(!fuse.evaluate(Some(&bar(dec!(100), dec!(99), 0.02))));
    }

    #[test]
    fn test_disabled_fuse_never_trips() {
        let mut fuse = CrashFuse::new(FuseConfig {
            enabled: false,
            ..FuseConfig::default()
        });
        assert!(!fuse.evaluate(Some(&bar(dec!(100), dec!(90), 0.0))));
    }
}
