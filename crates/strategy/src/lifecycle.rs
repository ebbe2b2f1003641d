//! Staged exit state machine for open positions.
//!
//! [`decide`] is pure: given the cached per-position state and fresh inputs it
//! picks at most one action. [`LifecycleManager::manage`] gathers the inputs from
//! the gateway, applies the action through the order executor or the stop
//! replacer, and books the trade once the position is gone.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use riskgate_core::config::{LifecycleConfig, TimeCutMode};
use riskgate_core::order_class::current_stop_price;
use riskgate_core::position::roi;
use riskgate_core::{retry_call, ExchangeGateway, GatewayError, PositionSnapshot, RetryPolicy, Side};
use riskgate_execution::{CloseFill, ExecutionError, OrderExecutor, StopReplaceError, StopReplacement};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::regime::EffectiveSettings;

// ============================================================================
// State and inputs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
    pub bars_held: u32,
    pub last_bar: Option<DateTime<Utc>>,
    pub tp1_done: bool,
    pub tp2_done: bool,
    pub last_trail_roi: Decimal,
    pub stop_price: Option<Decimal>,
    /// PnL booked by partial closes so far.
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Quantity closed so far.
    #[serde(default)]
    pub closed_quantity: Decimal,
}

impl LifecycleState {
    #[must_use]
    pub fn new(side: Side, entry_price: Decimal, quantity: Decimal, opened_at: DateTime<Utc>) -> Self {
        Self {
            side,
            entry_price,
            quantity,
            opened_at,
            bars_held: 0,
            last_bar: None,
            tp1_done: false,
            tp2_done: false,
            last_trail_roi: Decimal::ZERO,
            stop_price: None,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            closed_quantity: Decimal::ZERO,
        }
    }

    /// Counts a bar once per distinct bar time.
    pub fn observe_bar(&mut self, bar_time: DateTime<Utc>) {
        if self.last_bar.map_or(true, |last| bar_time > last) {
            if self.last_bar.is_some() {
                self.bars_held += 1;
            }
            self.last_bar = Some(bar_time);
        }
    }
}

/// Persisted view of a managed position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: Side,
    pub entry_price: Decimal,
    pub tp1_done: bool,
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub tp2_done: bool,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bars_held: u32,
    #[serde(default)]
    pub last_trail_roi: Decimal,
    /// Booking of partial closes, so a restart still reports the whole trade.
    #[serde(default)]
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub fees: Decimal,
    #[serde(default)]
    pub closed_quantity: Decimal,
}

impl PositionRecord {
    #[must_use]
    pub fn from_state(symbol: &str, state: &LifecycleState) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: state.quantity,
            side: state.side,
            entry_price: state.entry_price,
            tp1_done: state.tp1_done,
            stop_price: state.stop_price,
            tp2_done: state.tp2_done,
            opened_at: Some(state.opened_at),
            bars_held: state.bars_held,
            last_trail_roi: state.last_trail_roi,
            realized_pnl: state.realized_pnl,
            fees: state.fees,
            closed_quantity: state.closed_quantity,
        }
    }

    #[must_use]
    pub fn into_state(self, now: DateTime<Utc>) -> LifecycleState {
        LifecycleState {
            tp1_done: self.tp1_done,
            tp2_done: self.tp2_done,
            bars_held: self.bars_held,
            last_trail_roi: self.last_trail_roi,
            stop_price: self.stop_price,
            realized_pnl: self.realized_pnl,
            fees: self.fees,
            closed_quantity: self.closed_quantity,
            ..LifecycleState::new(self.side, self.entry_price, self.quantity, self.opened_at.unwrap_or(now))
        }
    }
}

/// Defensive overlay from the market gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOverlay {
    /// Multiplier on the trailing distance; below one tightens.
    pub sl_tighten_mult: Decimal,
    /// Arm trailing as soon as TP1 is done instead of waiting for the start roi.
    pub force_trailing_tighten: bool,
}

impl Default for StopOverlay {
    fn default() -> Self {
        Self {
            sl_tighten_mult: Decimal::ONE,
            force_trailing_tighten: false,
        }
    }
}

impl StopOverlay {
    #[must_use]
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        Self {
            sl_tighten_mult: Decimal::try_from(settings.sl_tighten_mult).unwrap_or(Decimal::ONE),
            force_trailing_tighten: settings.force_trailing_tighten,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleInputs {
    /// Gateway quantity; zero or less means flat.
    pub quantity: Decimal,
    pub mark: Option<Decimal>,
    pub current_stop: Option<Decimal>,
    /// Absolute ATR of the managing timeframe.
    pub atr: Option<f64>,
    pub fuse_active: bool,
    pub overlay: StopOverlay,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LifecycleAction {
    Hold,
    Reset,
    FuseTighten { stop: Decimal },
    /// `breakeven_stop` is `None` when the current stop is already tighter.
    TakeProfit1 { ratio: Decimal, breakeven_stop: Option<Decimal> },
    EarlyDefense { stop: Decimal },
    TakeProfit2 { ratio: Decimal },
    TakeProfit3,
    Trail { stop: Decimal, roi: Decimal },
    TimeCut { roi: Decimal },
}

// ============================================================================
// Decision
// ============================================================================

/// True when `candidate` is tighter than `current` for a position on `side`.
#[must_use]
pub fn improves(side: Side, candidate: Decimal, current: Option<Decimal>) -> bool {
    match current.filter(|c| *c > Decimal::ZERO) {
        None => true,
        Some(current) => match side {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        },
    }
}

/// Price `distance` away from `reference` on the losing side of a position.
fn stop_at(side: Side, reference: Decimal, distance: Decimal) -> Decimal {
    match side {
        Side::Long => reference * (Decimal::ONE - distance),
        Side::Short => reference * (Decimal::ONE + distance),
    }
}

/// Fraction of the remaining position closed at TP2.
#[must_use]
pub fn tp2_remaining_ratio(config: &LifecycleConfig) -> Decimal {
    let remainder = Decimal::ONE - config.tp1_ratio;
    if remainder <= Decimal::ZERO {
        return config.tp2_max_ratio;
    }
    (config.tp2_ratio / remainder).min(config.tp2_max_ratio)
}

/// Trailing distance in price units: an ATR multiple, or a fixed fraction of
/// the mark when ATR is unavailable.
#[must_use]
pub fn trail_offset(config: &LifecycleConfig, roi: Decimal, mark: Decimal, atr: Option<f64>) -> Decimal {
    let atr = atr
        .and_then(|a| Decimal::try_from(a).ok())
        .filter(|a| *a > Decimal::ZERO);
    match atr {
        Some(atr) => {
            let mult = if roi < config.trail_wide_roi {
                config.trail_atr_mult_near
            } else {
                config.trail_atr_mult_far
            };
            atr * mult
        }
        None => mark * config.trail_fallback_pct,
    }
}

fn time_cut_due(config: &LifecycleConfig, state: &LifecycleState, now: DateTime<Utc>) -> bool {
    let tc = &config.time_cut;
    match tc.mode {
        TimeCutMode::Candles => state.bars_held >= tc.max_candles,
        TimeCutMode::Minutes => (now - state.opened_at).num_minutes() > tc.max_minutes,
    }
}

/// Picks this cycle's action. The first matching rule wins.
#[must_use]
pub fn decide(config: &LifecycleConfig, state: &LifecycleState, inputs: &LifecycleInputs) -> LifecycleAction {
    if inputs.quantity <= Decimal::ZERO {
        return LifecycleAction::Reset;
    }
    let Some(mark) = inputs.mark.filter(|m| *m > Decimal::ZERO) else {
        return LifecycleAction::Hold;
    };
    let side = state.side;
    let entry = state.entry_price;
    let roi = roi(side, entry, mark);

    if inputs.fuse_active {
        let stop = stop_at(side, mark, config.fuse_stop_pct);
        if improves(side, stop, inputs.current_stop) {
            return LifecycleAction::FuseTighten { stop };
        }
        return LifecycleAction::Hold;
    }

    if !state.tp1_done {
        if roi >= config.tp1_roi {
            let breakeven_stop = Some(stop_at(side, entry, -config.breakeven_buffer))
                .filter(|stop| improves(side, *stop, inputs.current_stop));
            return LifecycleAction::TakeProfit1 {
                ratio: config.tp1_ratio,
                breakeven_stop,
            };
        }
        if roi >= config.early_defense_trigger {
            let stop = stop_at(side, entry, config.early_defense_stop);
            if improves(side, stop, inputs.current_stop) {
                return LifecycleAction::EarlyDefense { stop };
            }
        }
    }

    if state.tp1_done && !state.tp2_done && roi >= config.tp2_roi {
        return LifecycleAction::TakeProfit2 {
            ratio: tp2_remaining_ratio(config),
        };
    }

    if roi >= config.tp3_roi {
        return LifecycleAction::TakeProfit3;
    }

    // Only longs get the defensive overlay; shorts are the PANIC trade.
    let overlay = if side == Side::Long {
        inputs.overlay
    } else {
        StopOverlay::default()
    };
    let armed = roi >= config.trail_start_roi
        || (overlay.force_trailing_tighten && state.tp1_done && roi > Decimal::ZERO);
    if armed && roi - state.last_trail_roi >= config.trail_step_roi {
        let offset = trail_offset(config, roi, mark, inputs.atr) * overlay.sl_tighten_mult;
        let stop = match side {
            Side::Long => mark - offset,
            Side::Short => mark + offset,
        };
        if improves(side, stop, inputs.current_stop) {
            return LifecycleAction::Trail { stop, roi };
        }
    }

    if config.time_cut.enabled && roi < config.time_cut.min_profit_roi && time_cut_due(config, state, inputs.now) {
        return LifecycleAction::TimeCut { roi };
    }

    LifecycleAction::Hold
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("stop replacement failed: {0}")]
    Stop(#[from] StopReplaceError),
}

impl LifecycleError {
    /// Order placement failures, including stop moves, that feed the execution breaker.
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        match self {
            Self::Gateway(_) => false,
            Self::Execution(e) => e.is_execution_failure(),
            Self::Stop(e) => e.is_execution_failure(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    TimeCut,
    /// Closed outside the manager: stop triggered, liquidation, manual close.
    External,
}

/// A finished trade, booked once the position is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    /// Price of the final exit.
    pub exit_price: Decimal,
    /// Total quantity closed over the life of the trade.
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

/// Per-cycle context supplied by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ManageContext {
    pub atr: Option<f64>,
    pub bar_time: Option<DateTime<Utc>>,
    pub fuse_active: bool,
    pub overlay: StopOverlay,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManageReport {
    pub symbol: String,
    pub action: LifecycleAction,
    pub roi: Option<Decimal>,
    pub close: Option<CloseFill>,
    pub stop: Option<StopReplacement>,
    pub closed_trade: Option<ClosedTrade>,
}

impl ManageReport {
    fn new(symbol: &str, action: LifecycleAction) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            roi: None,
            close: None,
            stop: None,
            closed_trade: None,
        }
    }

    /// True when the persisted record for this symbol needs rewriting.
    #[must_use]
    pub fn changed_state(&self) -> bool {
        !matches!(self.action, LifecycleAction::Hold)
    }
}

pub struct LifecycleManager {
    gateway: Arc<dyn ExchangeGateway>,
    executor: Arc<OrderExecutor>,
    config: LifecycleConfig,
    retry: RetryPolicy,
    states: Mutex<HashMap<String, LifecycleState>>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        executor: Arc<OrderExecutor>,
        config: LifecycleConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            executor,
            config,
            retry,
            states: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Starts tracking a freshly opened position.
    pub fn track_entry(&self, symbol: &str, side: Side, entry_price: Decimal, quantity: Decimal, stop: Decimal) {
        let mut state = LifecycleState::new(side, entry_price, quantity, Utc::now());
        state.stop_price = Some(stop);
        self.states.lock().insert(symbol.to_string(), state);
    }

    #[must_use]
    pub fn state(&self, symbol: &str) -> Option<LifecycleState> {
        self.states.lock().get(symbol).cloned()
    }

    #[must_use]
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.states.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    #[must_use]
    pub fn export_records(&self) -> Vec<PositionRecord> {
        let states = self.states.lock();
        let mut records: Vec<PositionRecord> = states
            .iter()
            .map(|(symbol, state)| PositionRecord::from_state(symbol, state))
            .collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }

    pub fn import_records(&self, records: Vec<PositionRecord>) {
        let now = Utc::now();
        let mut states = self.states.lock();
        for record in records {
            info!(symbol = %record.symbol, side = %record.side, tp1_done = record.tp1_done, "restored position record");
            states.insert(record.symbol.clone(), record.into_state(now));
        }
    }

    fn fee(&self, notional: Decimal) -> Decimal {
        notional.abs() * self.config.fee_rate
    }

    /// Realized PnL and fees for closing `quantity` at `exit`.
    fn book(&self, state: &mut LifecycleState, quantity: Decimal, exit: Decimal) {
        let pnl = match state.side {
            Side::Long => (exit - state.entry_price) * quantity,
            Side::Short => (state.entry_price - exit) * quantity,
        };
        state.realized_pnl += pnl;
        state.fees += self.fee(state.entry_price * quantity) + self.fee(exit * quantity);
        state.closed_quantity += quantity;
    }

    fn finish(&self, symbol: &str, mut state: LifecycleState, remaining: Decimal, exit: Decimal, reason: ExitReason) -> ClosedTrade {
        self.book(&mut state, remaining, exit);
        let trade = ClosedTrade {
            symbol: symbol.to_string(),
            side: state.side,
            entry_price: state.entry_price,
            exit_price: exit,
            quantity: state.closed_quantity,
            pnl: state.realized_pnl,
            fees: state.fees,
            reason,
            closed_at: Utc::now(),
        };
        info!(
            symbol = %symbol,
            side = %trade.side,
            exit = %trade.exit_price,
            quantity = %trade.quantity,
            pnl = %trade.pnl,
            fees = %trade.fees,
            reason = ?reason,
            "trade closed"
        );
        trade
    }

    fn load_state(&self, symbol: &str, snapshot: &PositionSnapshot, side: Side, now: DateTime<Utc>) -> LifecycleState {
        let mut states = self.states.lock();
        match states.remove(symbol) {
            Some(state) if state.side == side => state,
            Some(stale) => {
                warn!(symbol = %symbol, cached = %stale.side, gateway = %side, "cached side disagrees with gateway, starting fresh");
                LifecycleState::new(side, snapshot.entry_price, snapshot.quantity, now)
            }
            None => LifecycleState::new(side, snapshot.entry_price, snapshot.quantity, now),
        }
    }

    /// Runs one management cycle for `symbol`.
    ///
    /// # Errors
    /// Gateway failures skip the cycle; a failed stop move keeps the old stop.
    pub async fn manage(&self, symbol: &str, ctx: &ManageContext) -> Result<ManageReport, LifecycleError> {
        let snapshot = retry_call(self.retry, "get_position", || self.gateway.get_position(symbol)).await?;

        let side = match snapshot.side {
            Some(side) if !snapshot.is_flat() => side,
            _ => {
                let mut report = ManageReport::new(symbol, LifecycleAction::Reset);
                let removed = self.states.lock().remove(symbol);
                if let Some(state) = removed {
                    info!(symbol = %symbol, "position gone on the exchange, resetting lifecycle state");
                    let exit = state.stop_price.unwrap_or(state.entry_price);
                    let remaining = state.quantity;
                    report.closed_trade = Some(self.finish(symbol, state, remaining, exit, ExitReason::External));
                } else {
                    report.action = LifecycleAction::Hold;
                }
                return Ok(report);
            }
        };

        let mut state = self.load_state(symbol, &snapshot, side, ctx.now);
        state.quantity = snapshot.quantity;
        if snapshot.entry_price > Decimal::ZERO {
            state.entry_price = snapshot.entry_price;
        }
        if let Some(bar) = ctx.bar_time {
            state.observe_bar(bar);
        }

        let result = self.step(symbol, &mut state, &snapshot, ctx).await;
        match &result {
            Ok(report) if report.closed_trade.is_some() => {}
            _ => {
                self.states.lock().insert(symbol.to_string(), state);
            }
        }
        result
    }

    async fn step(
        &self,
        symbol: &str,
        state: &mut LifecycleState,
        snapshot: &PositionSnapshot,
        ctx: &ManageContext,
    ) -> Result<ManageReport, LifecycleError> {
        let mark = retry_call(self.retry, "get_mark_price", || self.gateway.get_mark_price(symbol)).await?;
        let orders = retry_call(self.retry, "get_open_orders", || self.gateway.get_open_orders(symbol)).await?;
        let current_stop = current_stop_price(&orders, state.side);
        if current_stop.is_some() {
            state.stop_price = current_stop;
        }

        let inputs = LifecycleInputs {
            quantity: snapshot.quantity,
            mark: Some(mark),
            current_stop,
            atr: ctx.atr,
            fuse_active: ctx.fuse_active,
            overlay: ctx.overlay,
            now: ctx.now,
        };
        let action = decide(&self.config, state, &inputs);
        let mut report = ManageReport::new(symbol, action.clone());
        report.roi = (mark > Decimal::ZERO).then(|| roi(state.side, state.entry_price, mark));

        match action {
            LifecycleAction::Hold | LifecycleAction::Reset => {}
            LifecycleAction::FuseTighten { stop } => {
                warn!(symbol = %symbol, stop = %stop, "crash fuse active, tightening stop");
                report.stop = Some(self.move_stop(symbol, state, stop).await?);
            }
            LifecycleAction::EarlyDefense { stop } => {
                info!(symbol = %symbol, roi = ?report.roi, stop = %stop, "early defense");
                report.stop = Some(self.move_stop(symbol, state, stop).await?);
            }
            LifecycleAction::Trail { stop, roi } => {
                info!(symbol = %symbol, roi = %roi, stop = %stop, "trailing stop");
                report.stop = Some(self.move_stop(symbol, state, stop).await?);
                state.last_trail_roi = roi;
            }
            LifecycleAction::TakeProfit1 { ratio, breakeven_stop } => {
                let fill = self.executor.close_partial(symbol, ratio).await?;
                state.tp1_done = true;
                match &fill {
                    Some(fill) => {
                        info!(symbol = %symbol, roi = ?report.roi, quantity = %fill.quantity, "TP1 hit");
                        self.book(state, fill.quantity, mark);
                        state.quantity = fill.remaining;
                    }
                    None => info!(symbol = %symbol, "TP1 slice below exchange minimum, moving stop only"),
                }
                report.close = fill.clone();
                if fill.as_ref().map_or(snapshot.quantity, |f| f.remaining) > Decimal::ZERO {
                    match breakeven_stop {
                        Some(stop) => {
                            info!(symbol = %symbol, stop = %stop, "moving stop to breakeven");
                            report.stop = Some(self.move_stop(symbol, state, stop).await?);
                        }
                        None => info!(symbol = %symbol, stop = ?state.stop_price, "stop already past breakeven"),
                    }
                } else {
                    self.executor.close_all(symbol).await?;
                    report.closed_trade = Some(self.finish(symbol, state.clone(), Decimal::ZERO, mark, ExitReason::TakeProfit));
                }
            }
            LifecycleAction::TakeProfit2 { ratio } => {
                let fill = self.executor.close_partial(symbol, ratio).await?;
                state.tp2_done = true;
                if let Some(fill) = &fill {
                    info!(symbol = %symbol, roi = ?report.roi, quantity = %fill.quantity, "TP2 hit");
                    self.book(state, fill.quantity, mark);
                    state.quantity = fill.remaining;
                }
                report.close = fill;
            }
            LifecycleAction::TakeProfit3 | LifecycleAction::TimeCut { .. } => {
                let reason = if matches!(action, LifecycleAction::TakeProfit3) {
                    ExitReason::TakeProfit
                } else {
                    ExitReason::TimeCut
                };
                info!(symbol = %symbol, roi = ?report.roi, reason = ?reason, "closing position");
                let fill = self.executor.close_all(symbol).await?;
                let closed = fill.as_ref().map_or(state.quantity, |f| f.quantity);
                let remaining = fill.as_ref().map_or(Decimal::ZERO, |f| f.remaining);
                if remaining <= Decimal::ZERO {
                    report.closed_trade = Some(self.finish(symbol, state.clone(), closed, mark, reason));
                } else {
                    self.book(state, closed - remaining, mark);
                    state.quantity = remaining;
                }
                report.close = fill;
            }
        }
        Ok(report)
    }

    async fn move_stop(
        &self,
        symbol: &str,
        state: &mut LifecycleState,
        stop: Decimal,
    ) -> Result<StopReplacement, LifecycleError> {
        let replacement = self
            .executor
            .replacer()
            .replace_stop(symbol, state.side, stop)
            .await?;
        state.stop_price = Some(replacement.stop_price);
        Ok(replacement)
    }
}
