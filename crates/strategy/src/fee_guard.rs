//! Blocks new entries when fees eat too much of recent trading results.

use riskgate_core::config::{FeeGuardConfig, FeeRatioFormula};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fee_ratio({ratio:.2})")]
pub struct FeeRatioExceeded {
    pub ratio: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCost {
    pub pnl: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone)]
pub struct FeeRatioGuard {
    config: FeeGuardConfig,
    recent: VecDeque<TradeCost>,
}

impl FeeRatioGuard {
    #[must_use]
    pub fn new(config: FeeGuardConfig) -> Self {
        let capacity = config.window;
        Self {
            config,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    /// Adds a closed trade, dropping the oldest beyond the window.
    pub fn record(&mut self, pnl: Decimal, fee: Decimal) {
        if self.recent.len() == self.config.window {
            self.recent.pop_front();
        }
        self.recent.push_back(TradeCost { pnl, fee });
    }

    #[must_use]
    pub fn trades(&self) -> usize {
        self.recent.len()
    }

    /// Current ratio, or `None` with too few trades or a zero denominator.
    #[must_use]
    pub fn ratio(&self) -> Option<Decimal> {
        if self.recent.len() < self.config.min_trades {
            return None;
        }
        let fees: Decimal = self.recent.iter().map(|t| t.fee.abs()).sum();
        let denominator = match self.config.formula {
            FeeRatioFormula::AbsPnl => self.recent.iter().map(|t| t.pnl.abs()).sum(),
            FeeRatioFormula::GrossProfit => self
                .recent
                .iter()
                .map(|t| t.pnl.max(Decimal::ZERO))
                .sum(),
            FeeRatioFormula::NetPnl => self.recent.iter().map(|t| t.pnl).sum::<Decimal>().abs(),
        };
        if denominator.is_zero() {
            return None;
        }
        Some(fees / denominator)
    }

    /// # Errors
    /// Returns [`FeeRatioExceeded`] when the ratio is above `max_ratio`.
    pub fn check(&self) -> Result<(), FeeRatioExceeded> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.ratio() {
            Some(ratio) if ratio > self.config.max_ratio => {
                warn!(ratio = %ratio.round_dp(4), max = %self.config.max_ratio, "Fee ratio too high");
                Err(FeeRatioExceeded {
                    ratio: ratio.round_dp(2),
                })
            }
            _ => Ok(()),
        }
    }
}
