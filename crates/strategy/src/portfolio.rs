//! Portfolio-level entry gating: circuit breakers, loss-streak cooldown and
//! position caps.

use chrono::{DateTime, NaiveDate, Utc};
use riskgate_core::config::PortfolioRiskConfig;
use riskgate_core::{MarketGate, Position, Regime, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::regime::EffectiveSettings;

/// Why a new entry was refused. `Display` yields the stable reason string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryDenial {
    #[error("circuit_breaker({reason})")]
    CircuitBreaker { reason: String },

    #[error("daily_loss({pnl_pct:.2}%)")]
    DailyLoss { pnl_pct: Decimal },

    #[error("cooldown({bars}_bars)")]
    Cooldown { bars: u32 },

    #[error("max_entries_this_bar({count}/{max})")]
    MaxEntriesThisBar { count: u32, max: u32 },

    #[error("max_positions({count}/{max})")]
    MaxPositions { count: usize, max: usize },

    #[error("panic_gate_no_longs")]
    PanicGateNoLongs,

    #[error("max_longs({count}/{max})")]
    MaxLongs { count: usize, max: usize },

    #[error("max_shorts({count}/{max})")]
    MaxShorts { count: usize, max: usize },
}

/// Reason string for a gating decision, `"ok"` when allowed.
#[must_use]
pub fn decision_reason(decision: &Result<(), EntryDenial>) -> String {
    match decision {
        Ok(()) => "ok".to_string(),
        Err(denial) => denial.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioRiskState {
    pub daily_start_equity: Decimal,
    pub daily_realized_pnl: Decimal,
    pub consecutive_losses: u32,
    pub cooldown_remaining_bars: u32,
    pub entries_this_bar: u32,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_reason: Option<String>,
    pub execution_failure_count: u32,
    /// Set by the execution-failure breaker, which only an operator clears.
    pub execution_breaker_active: bool,
    pub current_day: Option<NaiveDate>,
    pub last_bar: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PortfolioRiskManager {
    config: PortfolioRiskConfig,
    state: PortfolioRiskState,
}

impl PortfolioRiskManager {
    #[must_use]
    pub fn new(config: PortfolioRiskConfig) -> Self {
        info!(
            max_positions = config.max_positions_total,
            entries_per_bar = config.max_new_entries_per_bar,
            daily_loss_limit_pct = %config.daily_loss_limit_pct,
            "Portfolio risk manager initialized"
        );
        Self {
            config,
            state: PortfolioRiskState::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PortfolioRiskConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> PortfolioRiskState {
        self.state.clone()
    }

    /// Decides whether a new position may be opened. Checks run in priority
    /// order and the first failing one is reported; the daily-loss check trips
    /// the circuit breaker as a side effect.
    ///
    /// # Errors
    /// Returns the [`EntryDenial`] of the first failing check.
    pub fn can_open_position(
        &mut self,
        positions: &[Position],
        direction: Side,
        gate: MarketGate,
        equity: Decimal,
    ) -> Result<(), EntryDenial> {
        if self.state.circuit_breaker_active {
            return Err(EntryDenial::CircuitBreaker {
                reason: self.state.circuit_breaker_reason.clone().unwrap_or_default(),
            });
        }

        self.check_daily_loss(equity)?;

        if self.state.cooldown_remaining_bars > 0 {
            return Err(EntryDenial::Cooldown {
                bars: self.state.cooldown_remaining_bars,
            });
        }

        if self.state.entries_this_bar >= self.config.max_new_entries_per_bar {
            return Err(EntryDenial::MaxEntriesThisBar {
                count: self.state.entries_this_bar,
                max: self.config.max_new_entries_per_bar,
            });
        }

        let max_total = self.max_positions(gate);
        if positions.len() >= max_total {
            return Err(EntryDenial::MaxPositions {
                count: positions.len(),
                max: max_total,
            });
        }

        let same_side = positions.iter().filter(|p| p.side == direction).count();
        match direction {
            Side::Long => {
                if gate == MarketGate::Panic {
                    return Err(EntryDenial::PanicGateNoLongs);
                }
                if same_side >= self.config.max_longs {
                    return Err(EntryDenial::MaxLongs {
                        count: same_side,
                        max: self.config.max_longs,
                    });
                }
            }
            Side::Short => {
                if same_side >= self.config.max_shorts {
                    return Err(EntryDenial::MaxShorts {
                        count: same_side,
                        max: self.config.max_shorts,
                    });
                }
            }
        }

        Ok(())
    }

    /// Position cap in force under `gate`.
    #[must_use]
    pub fn max_positions(&self, gate: MarketGate) -> usize {
        if gate.is_defensive() {
            self.config.defensive_max_positions
        } else {
            self.config.max_positions_total
        }
    }

    fn check_daily_loss(&mut self, equity: Decimal) -> Result<(), EntryDenial> {
        let start = self.state.daily_start_equity;
        if start <= Decimal::ZERO {
            return Ok(());
        }
        let pnl_pct = (equity - start) / start * Decimal::ONE_HUNDRED;
        let limit_pct = self.config.daily_loss_limit_pct * Decimal::ONE_HUNDRED;
        if pnl_pct < -limit_pct {
            let denial = EntryDenial::DailyLoss {
                pnl_pct: pnl_pct.round_dp(2),
            };
            self.trip(denial.to_string());
            return Err(denial);
        }
        Ok(())
    }

    fn trip(&mut self, reason: String) {
        error!(alert = true, reason = %reason, "Circuit breaker activated");
        self.state.circuit_breaker_active = true;
        self.state.circuit_breaker_reason = Some(reason);
    }

    /// Bar-close hook. Returns `false` if `bar_time` was already seen.
    pub fn on_new_bar(&mut self, bar_time: DateTime<Utc>) -> bool {
        if self.state.last_bar.is_some_and(|last| bar_time <= last) {
            return false;
        }
        self.state.last_bar = Some(bar_time);
        self.state.entries_this_bar = 0;
        if self.state.cooldown_remaining_bars > 0 {
            self.state.cooldown_remaining_bars -= 1;
            info!(remaining = self.state.cooldown_remaining_bars, "Cooldown bar elapsed");
        }
        true
    }

    pub fn mark_entry(&mut self) {
        self.state.entries_this_bar += 1;
        info!(
            entries = self.state.entries_this_bar,
            max = self.config.max_new_entries_per_bar,
            "Entry recorded for this bar"
        );
    }

    /// Books a closed trade. A losing streak of `max_consecutive_losses`
    /// starts the cooldown and resets the streak.
    pub fn record_trade_result(&mut self, pnl: Decimal) {
        self.state.daily_realized_pnl += pnl;
        if pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
            info!(consecutive = self.state.consecutive_losses, pnl = %pnl, "Loss recorded");
            if self.state.consecutive_losses >= self.config.max_consecutive_losses {
                self.state.cooldown_remaining_bars = self.config.cooldown_bars;
                self.state.consecutive_losses = 0;
                warn!(bars = self.config.cooldown_bars, "Cooldown activated after loss streak");
            }
        } else {
            self.state.consecutive_losses = 0;
        }
    }

    /// Counts a failed order placement. Returns `true` when this failure trips
    /// the execution breaker.
    pub fn record_execution_failure(&mut self) -> bool {
        self.state.execution_failure_count += 1;
        let count = self.state.execution_failure_count;
        warn!(count, limit = self.config.execution_failure_limit, "Execution failure recorded");
        if count >= self.config.execution_failure_limit && !self.state.execution_breaker_active {
            self.state.execution_breaker_active = true;
            self.trip(format!("execution_failures({count})"));
            return true;
        }
        false
    }

    /// Clears the failure streak. An already tripped breaker stays tripped.
    pub fn record_execution_success(&mut self) {
        self.state.execution_failure_count = 0;
    }

    /// Day rollover. Returns `false` when `today` was already rolled.
    pub fn roll_day(&mut self, today: NaiveDate, equity: Decimal) -> bool {
        if self.state.current_day == Some(today) {
            return false;
        }
        self.state.current_day = Some(today);
        self.state.daily_start_equity = equity;
        self.state.daily_realized_pnl = Decimal::ZERO;
        self.state.consecutive_losses = 0;
        self.state.cooldown_remaining_bars = 0;
        if !self.state.execution_breaker_active {
            self.state.circuit_breaker_active = false;
            self.state.circuit_breaker_reason = None;
        }
        info!(day = %today, equity = %equity, "Daily risk reset");
        true
    }

    /// Clears every breaker, including the execution-failure one.
    pub fn operator_reset(&mut self, equity: Decimal) {
        let current_day = self.state.current_day;
        let last_bar = self.state.last_bar;
        self.state = PortfolioRiskState {
            daily_start_equity: equity,
            current_day,
            last_bar,
            ..PortfolioRiskState::default()
        };
        warn!(equity = %equity, "Operator reset of portfolio risk state");
    }

    /// Position scale as a decimal for sizing.
    #[must_use]
    pub fn position_scale(&self, settings: &EffectiveSettings) -> Decimal {
        Decimal::try_from(settings.position_scale).unwrap_or(Decimal::ZERO)
    }

    /// Leverage ceiling from the volatility bucket, tightened by PANIC.
    #[must_use]
    pub fn leverage_cap(&self, regime: Regime, gate: MarketGate) -> u32 {
        if gate == MarketGate::Panic {
            self.config.leverage_cap_panic
        } else if regime.is_high_vol() {
            self.config.leverage_cap_high_vol
        } else {
            self.config.leverage_cap_low_vol
        }
    }

    #[must_use]
    pub fn risk_per_trade_pct(&self) -> Decimal {
        self.config.risk_per_trade_pct
    }
}
