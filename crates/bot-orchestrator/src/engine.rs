//! The decision cycle and the loops around it.
//!
//! One [`Engine`] owns every component. The decision loop calls
//! [`Engine::evaluate_cycle`] on a fixed interval, the reconciler loop repairs
//! drift independently, and the optional listener only refreshes last-seen
//! timestamps. All three stop on the shared flag from [`Engine::stop_handle`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use riskgate_core::config::AppConfig;
use riskgate_core::shutdown::sleep_or_stop;
use riskgate_core::{
    retry_call, risk_based_quantity, EntrySignal, ExchangeEvent, ExchangeGateway, JsonStore, MarketDataProvider,
    MarketGate, MarketSnapshot, Position, Side, SignalSource,
};
use riskgate_execution::{ExecutionError, OrderExecutor, ReconcileReport, Reconciler, StateStore, StopReplacer, SymbolLocks};
use riskgate_selector::{Candidate, CandidateScore, CandidateScorer};
use riskgate_strategy::{
    CrashFuse, EffectiveSettings, EntryGate, FeeRatioGuard, LifecycleAction, LifecycleError, LifecycleManager,
    ManageContext, ManageReport, PortfolioRiskManager, RegimeDetector, StopOverlay,
};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::events::{alert_message, CycleReport, EngineEvent, EngineStatus, EntryAttempt, EntryOutcome};
use crate::listener::listen;
use crate::records::{PositionRecordStore, ENTRY_GATE_FILE};

const EVENT_CAPACITY: usize = 256;
const MAX_STALE_WINDOW_DAYS: i64 = 365;

/// Decision-side state. Only one cycle touches it at a time.
struct DecisionState {
    regimes: RegimeDetector,
    portfolio: PortfolioRiskManager,
    entry_gate: EntryGate,
    fuse: CrashFuse,
    fee_guard: FeeRatioGuard,
}

/// A signal that passed the regime filter, with the settings it was produced under.
struct Proposal {
    signal: EntrySignal,
    settings: EffectiveSettings,
    snapshot: MarketSnapshot,
}

pub struct Engine {
    config: AppConfig,
    gateway: Arc<dyn ExchangeGateway>,
    market: Arc<dyn MarketDataProvider>,
    signals: Arc<dyn SignalSource>,
    store: Arc<StateStore>,
    executor: Arc<OrderExecutor>,
    reconciler: Arc<Reconciler>,
    lifecycle: Arc<LifecycleManager>,
    scorer: CandidateScorer,
    records: PositionRecordStore,
    decision: Mutex<DecisionState>,
    events: broadcast::Sender<EngineEvent>,
    stop: Arc<AtomicBool>,
    cycles: AtomicU64,
}

impl Engine {
    /// Wires every component and restores persisted state from
    /// `engine.state_dir`.
    ///
    /// # Errors
    /// Returns error if the config is invalid or the state directory cannot
    /// be created.
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn ExchangeGateway>,
        market: Arc<dyn MarketDataProvider>,
        signals: Arc<dyn SignalSource>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let state_dir = config.engine.state_dir.clone();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        let store = Arc::new(StateStore::new());
        let locks = Arc::new(SymbolLocks::new());
        let replacer = Arc::new(StopReplacer::new(
            gateway.clone(),
            store.clone(),
            locks.clone(),
            config.stop_replace.clone(),
            config.retry,
        ));
        let executor = Arc::new(OrderExecutor::new(
            gateway.clone(),
            store.clone(),
            locks.clone(),
            replacer.clone(),
            config.retry,
        ));
        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            store.clone(),
            locks,
            replacer,
            config.reconcile.clone(),
            config.retry,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            gateway.clone(),
            executor.clone(),
            config.lifecycle.clone(),
            config.retry,
        ));

        let records = PositionRecordStore::in_dir(&state_dir);
        let restored = records.load();
        if !restored.is_empty() {
            info!(count = restored.len(), path = %records.path().display(), "Restoring position records");
            lifecycle.import_records(restored);
        }

        let entry_gate = EntryGate::new(
            config.entry_gate.clone(),
            Some(JsonStore::new(state_dir.join(ENTRY_GATE_FILE))),
            Utc::now(),
        )
        .context("failed to build entry gate")?;

        let decision = DecisionState {
            regimes: RegimeDetector::new(config.regime.clone()),
            portfolio: PortfolioRiskManager::new(config.portfolio.clone()),
            entry_gate,
            fuse: CrashFuse::new(config.fuse.clone()),
            fee_guard: FeeRatioGuard::new(config.fee_guard.clone()),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            symbols = config.engine.symbols.len(),
            benchmark = %config.engine.benchmark_symbol,
            state_dir = %state_dir.display(),
            "Engine initialized"
        );

        Ok(Self {
            scorer: CandidateScorer::new(config.scorer.clone()),
            config,
            gateway,
            market,
            signals,
            store,
            executor,
            reconciler,
            lifecycle,
            records,
            decision: Mutex::new(decision),
            events,
            stop: Arc::new(AtomicBool::new(false)),
            cycles: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Shared stop flag. Setting it ends every loop at its next check.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop(&self) {
        info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Decision cycle
    // ========================================================================

    /// Runs one full decision cycle.
    ///
    /// Transient failures skip the affected step and are listed in
    /// [`CycleReport::skipped`]; the cycle itself never fails.
    pub async fn evaluate_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let mut report = CycleReport::new(cycle, now);
        if self.is_stopped() {
            report.stopped = true;
            return report;
        }

        let mut guard = self.decision.lock().await;
        let d = &mut *guard;

        let equity = match retry_call(self.config.retry, "get_balance", || self.gateway.get_balance()).await {
            Ok(equity) => equity,
            Err(e) => {
                warn!(error = %e, "Balance unavailable, skipping cycle");
                report.skip("balance", "account", &e);
                return report;
            }
        };
        report.equity = Some(equity);
        d.portfolio.roll_day(d.entry_gate.local_day(now), equity);

        let snapshots = self.observe_market(d, &mut report).await;

        self.manage_positions(d, &snapshots, &mut report, now).await;

        let held = self.open_positions();
        let proposals = self.collect_proposals(d, &snapshots, &held, report.gate);
        let ranked = self.rank_candidates(&proposals, &held, &mut report).await;

        if let Some(top) = ranked.first() {
            if let Some(proposal) = proposals.iter().find(|p| p.signal.symbol == top.symbol) {
                let outcome = self.try_entry(d, proposal, &held, equity, &report, now).await;
                report.entry = Some(EntryAttempt {
                    symbol: proposal.signal.symbol.clone(),
                    side: proposal.signal.side,
                    signal_type: proposal.signal.signal_type.clone(),
                    score: top.final_score,
                    outcome,
                });
            }
        }
        report.candidates = ranked;
        drop(guard);

        debug!(
            cycle,
            gate = %report.gate,
            fuse = report.fuse_active,
            managed = report.managed.len(),
            candidates = report.candidates.len(),
            "Cycle complete"
        );
        self.publish(EngineEvent::CycleCompleted { cycle, at: Utc::now() });
        report
    }

    /// Benchmark regime, market gate and fuse, then every universe symbol.
    async fn observe_market(&self, d: &mut DecisionState, report: &mut CycleReport) -> HashMap<String, MarketSnapshot> {
        let benchmark = &self.config.engine.benchmark_symbol;
        let mut snapshots = HashMap::new();

        match self.market.snapshot(benchmark).await {
            Ok(snapshot) => {
                let reading = d.regimes.observe_benchmark(&snapshot);
                d.portfolio.on_new_bar(snapshot.bar_time);
                report.regimes.insert(benchmark.clone(), reading.benchmark.regime);
                snapshots.insert(benchmark.clone(), snapshot);
            }
            Err(e) => {
                warn!(symbol = %benchmark, error = %e, "Benchmark snapshot unavailable");
                report.skip("snapshot", benchmark, &e);
            }
        }
        report.gate = d.regimes.gate();

        let fuse_bar = match self.market.fuse_bar(benchmark).await {
            Ok(bar) => bar,
            Err(e) => {
                warn!(symbol = %benchmark, error = %e, "Fuse bar unavailable");
                report.skip("fuse_bar", benchmark, &e);
                None
            }
        };
        report.fuse_active = d.fuse.evaluate(fuse_bar.as_ref());

        for symbol in &self.config.engine.symbols {
            if symbol == benchmark {
                continue;
            }
            match self.market.snapshot(symbol).await {
                Ok(snapshot) => {
                    let reading = d.regimes.observe(&snapshot);
                    d.portfolio.on_new_bar(snapshot.bar_time);
                    report.regimes.insert(symbol.clone(), reading.regime);
                    snapshots.insert(symbol.clone(), snapshot);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Snapshot unavailable");
                    report.skip("snapshot", symbol, &e);
                }
            }
        }
        snapshots
    }

    async fn manage_positions(
        &self,
        d: &mut DecisionState,
        snapshots: &HashMap<String, MarketSnapshot>,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) {
        let overlay = self.overlay(report.gate);
        let mut dirty = false;
        for symbol in self.managed_symbols() {
            let snapshot = snapshots.get(&symbol);
            let ctx = ManageContext {
                atr: snapshot.map(|s| s.atr).filter(|atr| atr.is_finite() && *atr > 0.0),
                bar_time: snapshot.map(|s| s.bar_time),
                fuse_active: report.fuse_active,
                overlay,
                now,
            };
            match self.lifecycle.manage(&symbol, &ctx).await {
                Ok(managed) => {
                    dirty |= managed.changed_state();
                    self.after_manage(d, &managed);
                    if managed.action != LifecycleAction::Hold {
                        report.managed.push(managed);
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Position management skipped");
                    if e.is_execution_failure() {
                        self.note_execution_failure(d);
                    }
                    report.skip("manage", &symbol, &e);
                }
            }
        }
        if dirty {
            self.persist_records();
        }
    }

    fn after_manage(&self, d: &mut DecisionState, managed: &ManageReport) {
        if let Some(stop) = &managed.stop {
            self.publish(EngineEvent::StopMoved {
                symbol: managed.symbol.clone(),
                order_id: stop.order_id.clone(),
                stop_price: stop.stop_price,
            });
            if !stop.zombies.is_empty() {
                self.alert(
                    &managed.symbol,
                    format!("old stops left live after replace: {}", stop.zombies.join(", ")),
                );
            }
        }
        if let Some(trade) = &managed.closed_trade {
            d.portfolio.record_trade_result(trade.pnl - trade.fees);
            d.fee_guard.record(trade.pnl, trade.fees);
            self.publish(EngineEvent::PositionClosed(trade.clone()));
        }
    }

    /// Signals from the external source for flat universe symbols whose
    /// regime allows trading.
    fn collect_proposals(
        &self,
        d: &DecisionState,
        snapshots: &HashMap<String, MarketSnapshot>,
        held: &[Position],
        gate: MarketGate,
    ) -> Vec<Proposal> {
        let mut proposals = Vec::new();
        for symbol in &self.config.engine.symbols {
            if held.iter().any(|p| &p.symbol == symbol) {
                continue;
            }
            let (Some(snapshot), Some(regime)) = (snapshots.get(symbol), d.regimes.current(symbol)) else {
                continue;
            };
            let settings = EffectiveSettings::resolve(&self.config.regime_settings, regime, gate);
            if !settings.trade_enabled {
                debug!(symbol = %symbol, regime = %regime, "Trading disabled in regime");
                continue;
            }
            let Some(signal) = self.signals.evaluate(snapshot, &settings.view()) else {
                continue;
            };
            if signal.symbol != *symbol {
                warn!(expected = %symbol, got = %signal.symbol, source = self.signals.name(), "Signal for wrong symbol ignored");
                continue;
            }
            debug!(symbol = %symbol, side = %signal.side, signal_type = %signal.signal_type, "Signal proposed");
            proposals.push(Proposal {
                signal,
                settings,
                snapshot: snapshot.clone(),
            });
        }
        proposals
    }

    /// Hard filter and score the proposals, one pass per direction, best first.
    async fn rank_candidates(
        &self,
        proposals: &[Proposal],
        held: &[Position],
        report: &mut CycleReport,
    ) -> Vec<CandidateScore> {
        let mut by_side: HashMap<Side, Vec<Candidate>> = HashMap::new();
        for proposal in proposals {
            let symbol = proposal.signal.symbol.as_str();
            let ticker = match retry_call(self.config.retry, "get_book_ticker", || self.gateway.get_book_ticker(symbol))
                .await
            {
                Ok(ticker) => Some(ticker),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Book ticker unavailable");
                    report.skip("ticker", symbol, &e);
                    None
                }
            };
            let funding = match retry_call(self.config.retry, "get_funding_rate", || {
                self.gateway.get_funding_rate(symbol)
            })
            .await
            {
                Ok(rate) => Some(rate),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Funding rate unavailable");
                    report.skip("funding", symbol, &e);
                    None
                }
            };
            by_side
                .entry(proposal.signal.side)
                .or_default()
                .push(Candidate::from_snapshot(&proposal.snapshot, ticker, funding));
        }

        let mut ranked = Vec::new();
        for side in [Side::Long, Side::Short] {
            let Some(candidates) = by_side.get(&side) else {
                continue;
            };
            let selection = self.scorer.score_and_select(candidates, held, side);
            report.rejected.extend(selection.rejected);
            ranked.extend(selection.selected);
        }
        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        ranked
    }

    /// Runs the entry checks in order and opens the position if all pass.
    async fn try_entry(
        &self,
        d: &mut DecisionState,
        proposal: &Proposal,
        held: &[Position],
        equity: Decimal,
        report: &CycleReport,
        now: DateTime<Utc>,
    ) -> EntryOutcome {
        let signal = &proposal.signal;
        let symbol = signal.symbol.as_str();
        let denied = |reason: String| {
            info!(symbol = %symbol, side = %signal.side, reason = %reason, "Entry denied");
            EntryOutcome::Denied { reason }
        };

        if report.fuse_active {
            return denied("crash_fuse".to_string());
        }

        let breaker_was_active = d.portfolio.state().circuit_breaker_active;
        let decision = d.portfolio.can_open_position(held, signal.side, report.gate, equity);
        let state = d.portfolio.state();
        if !breaker_was_active && state.circuit_breaker_active {
            self.breaker_tripped(state.circuit_breaker_reason.unwrap_or_default());
        }
        if let Err(denial) = decision {
            return denied(denial.to_string());
        }

        if let Err(exceeded) = d.fee_guard.check() {
            return denied(exceeded.to_string());
        }

        let fingerprint = signal.setup_context(&proposal.snapshot).fingerprint();
        if let Err(denial) = d.entry_gate.check(symbol, &fingerprint, now) {
            return denied(denial.to_string());
        }

        let scale = d.portfolio.position_scale(&proposal.settings);
        let leverage = d
            .portfolio
            .leverage_cap(proposal.settings.regime, report.gate)
            .min(proposal.settings.leverage_cap);
        let quantity = match risk_based_quantity(
            equity,
            signal.entry_ref,
            signal.stop_price,
            d.portfolio.risk_per_trade_pct(),
            scale,
            leverage,
        ) {
            Ok(quantity) => quantity,
            Err(e) => return denied(format!("sizing({e})")),
        };

        info!(
            symbol = %symbol,
            side = %signal.side,
            quantity = %quantity,
            stop = %signal.stop_price,
            scale = %scale,
            leverage,
            setup = %fingerprint,
            "Opening position"
        );

        match self.executor.open_position(signal, quantity).await {
            Ok(fill) => {
                d.portfolio.record_execution_success();
                d.portfolio.mark_entry();
                if let Err(e) = d.entry_gate.record_entry(symbol, &fingerprint, now) {
                    warn!(symbol = %symbol, error = %e, "Failed to persist entry gate record");
                }
                self.lifecycle
                    .track_entry(symbol, fill.side, fill.entry_price, fill.quantity, fill.stop.stop_price);
                self.persist_records();
                self.publish(EngineEvent::EntryOpened {
                    symbol: fill.symbol.clone(),
                    side: fill.side,
                    quantity: fill.quantity,
                    entry_price: fill.entry_price,
                    stop_price: fill.stop.stop_price,
                });
                EntryOutcome::Opened {
                    quantity: fill.quantity,
                    entry_price: fill.entry_price,
                    stop_price: fill.stop.stop_price,
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Entry failed");
                if matches!(e, ExecutionError::UnprotectedEntry { .. }) {
                    self.alert(symbol, e.to_string());
                }
                if e.is_execution_failure() {
                    self.note_execution_failure(d);
                }
                EntryOutcome::Failed { error: e.to_string() }
            }
        }
    }

    // ========================================================================
    // Reconciliation and loops
    // ========================================================================

    /// Reconciles every universe and tracked symbol once.
    pub async fn reconcile_all(&self) -> Vec<ReconcileReport> {
        let reports = self.reconciler.reconcile_all(&self.managed_symbols()).await;
        for report in &reports {
            self.forward_reconcile(report);
        }
        reports
    }

    fn forward_reconcile(&self, report: &ReconcileReport) {
        // the reconciler already logged it
        if let Some(message) = alert_message(report) {
            self.publish(EngineEvent::CriticalAlert {
                symbol: report.symbol.clone(),
                message,
                at: report.checked_at,
            });
        }
    }

    /// Runs the decision loop, the reconciler loop and, given a user stream,
    /// the event listener until the stop flag is set.
    ///
    /// # Errors
    /// Returns error if one of the loops panicked.
    pub async fn run(self: Arc<Self>, user_stream: Option<mpsc::Receiver<ExchangeEvent>>) -> Result<()> {
        info!("Engine starting");

        let decision = {
            let engine = self.clone();
            tokio::spawn(async move { engine.decision_loop().await })
        };
        let reconcile = {
            let engine = self.clone();
            tokio::spawn(async move {
                let reconciler = engine.reconciler.clone();
                reconciler
                    .run(
                        || engine.managed_symbols(),
                        engine.stop.clone(),
                        |report| engine.forward_reconcile(report),
                    )
                    .await;
            })
        };
        let listener = user_stream.map(|rx| tokio::spawn(listen(self.store.clone(), rx, self.stop.clone())));

        decision.await.context("decision loop panicked")?;
        reconcile.await.context("reconciler loop panicked")?;
        if let Some(listener) = listener {
            listener.await.context("event listener panicked")?;
        }

        info!(cycles = self.cycles.load(Ordering::SeqCst), "Engine stopped");
        Ok(())
    }

    async fn decision_loop(&self) {
        let interval = Duration::from_secs(self.config.engine.decision_interval_secs);
        info!(interval_secs = self.config.engine.decision_interval_secs, "Decision loop started");
        loop {
            if self.is_stopped() {
                break;
            }
            let report = self.evaluate_cycle().await;
            if !report.skipped.is_empty() {
                debug!(cycle = report.cycle, skipped = ?report.skipped, "Cycle skipped steps");
            }
            if !sleep_or_stop(&self.stop, interval).await {
                break;
            }
        }
        info!("Decision loop stopped");
    }

    // ========================================================================
    // Status and operator actions
    // ========================================================================

    pub async fn status(&self) -> EngineStatus {
        let d = self.decision.lock().await;
        let portfolio = d.portfolio.state();
        let positions = self.lifecycle.export_records();
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(Duration::from_secs(self.config.engine.stale_after_secs))
            .unwrap_or_else(|_| chrono::Duration::days(MAX_STALE_WINDOW_DAYS));
        let stale_symbols = positions
            .iter()
            .filter(|r| self.store.is_stale(&r.symbol, max_age, now))
            .map(|r| r.symbol.clone())
            .collect();

        EngineStatus {
            cycles: self.cycles.load(Ordering::SeqCst),
            stopped: self.is_stopped(),
            breaker_active: portfolio.circuit_breaker_active || portfolio.execution_breaker_active,
            breaker_reason: portfolio.circuit_breaker_reason.clone(),
            gate: d.regimes.gate(),
            fuse: d.fuse.status(),
            regimes: d.regimes.regimes().into_iter().collect(),
            positions,
            stale_symbols,
            portfolio,
            entry_gate: d.entry_gate.record().clone(),
            fee_ratio: d.fee_guard.ratio(),
        }
    }

    /// Clears every breaker, including the execution-failure one, and
    /// rebases the day on current equity.
    ///
    /// # Errors
    /// Returns error if equity cannot be fetched.
    pub async fn operator_reset(&self) -> Result<()> {
        let equity = retry_call(self.config.retry, "get_balance", || self.gateway.get_balance())
            .await
            .context("failed to fetch equity for reset")?;
        self.decision.lock().await.portfolio.operator_reset(equity);
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Universe symbols plus anything tracked or cached as open.
    fn managed_symbols(&self) -> Vec<String> {
        let mut symbols: BTreeSet<String> = self.config.engine.symbols.iter().cloned().collect();
        symbols.extend(self.lifecycle.tracked_symbols());
        symbols.extend(self.store.positions().into_iter().map(|p| p.symbol));
        symbols.into_iter().collect()
    }

    fn open_positions(&self) -> Vec<Position> {
        self.lifecycle
            .tracked_symbols()
            .into_iter()
            .filter_map(|symbol| {
                self.lifecycle.state(&symbol).map(|state| Position {
                    symbol,
                    side: state.side,
                    quantity: state.quantity,
                    entry_price: state.entry_price,
                    opened_at: state.opened_at,
                })
            })
            .collect()
    }

    fn overlay(&self, gate: MarketGate) -> StopOverlay {
        self.config
            .regime_settings
            .modifier(gate)
            .map_or_else(StopOverlay::default, |m| StopOverlay {
                sl_tighten_mult: Decimal::try_from(m.sl_tighten_mult).unwrap_or(Decimal::ONE),
                force_trailing_tighten: m.force_trailing_tighten,
            })
    }

    fn persist_records(&self) {
        if let Err(e) = self.records.save_all(&self.lifecycle.export_records()) {
            warn!(error = %e, path = %self.records.path().display(), "Failed to persist position records");
        }
    }

    fn note_execution_failure(&self, d: &mut DecisionState) {
        if d.portfolio.record_execution_failure() {
            self.breaker_tripped(d.portfolio.state().circuit_breaker_reason.unwrap_or_default());
        }
    }

    fn breaker_tripped(&self, reason: String) {
        error!(alert = true, reason = %reason, "Circuit breaker tripped");
        self.publish(EngineEvent::BreakerTripped { reason, at: Utc::now() });
    }

    fn alert(&self, symbol: &str, message: String) {
        error!(alert = true, symbol = %symbol, message = %message, "Critical alert");
        self.publish(EngineEvent::CriticalAlert {
            symbol: symbol.to_string(),
            message,
            at: Utc::now(),
        });
    }

    fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
