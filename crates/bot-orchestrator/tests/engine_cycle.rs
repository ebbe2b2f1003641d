//! Full decision cycles against the paper gateway.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use riskgate_core::config::{AppConfig, StopReplaceConfig};
use riskgate_core::{
    EntrySignal, FuseBar, MarketDataProvider, MarketGate, MarketSnapshot, RegimeView, RetryPolicy, Side, SignalSource,
};
use riskgate_execution::{PaperGateway, ReconcileOutcome};
use riskgate_orchestrator::{Engine, EngineEvent, EntryOutcome};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct ScriptedMarket {
    snapshots: Mutex<HashMap<String, MarketSnapshot>>,
    fuse_bar: Mutex<Option<FuseBar>>,
}

impl ScriptedMarket {
    fn set(&self, snapshot: MarketSnapshot) {
        self.snapshots.lock().insert(snapshot.symbol.clone(), snapshot);
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedMarket {
    async fn snapshot(&self, symbol: &str) -> anyhow::Result<MarketSnapshot> {
        self.snapshots
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no data for {symbol}"))
    }

    async fn fuse_bar(&self, _symbol: &str) -> anyhow::Result<Option<FuseBar>> {
        Ok(self.fuse_bar.lock().clone())
    }
}

/// Proposes a long with a 2% stop on every symbol it is given.
struct LongEverything;

impl SignalSource for LongEverything {
    fn evaluate(&self, snapshot: &MarketSnapshot, _regime: &RegimeView) -> Option<EntrySignal> {
        Some(EntrySignal {
            symbol: snapshot.symbol.clone(),
            side: Side::Long,
            signal_type: "pullback".into(),
            timeframe: "15m".into(),
            bar_time: snapshot.bar_time,
            entry_ref: snapshot.close,
            stop_price: snapshot.close * dec!(0.98),
            extras: BTreeMap::new(),
        })
    }

    fn name(&self) -> &str {
        "long_everything"
    }
}

fn bar_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap()
}

fn uptrend(symbol: &str, close: Decimal, atr_pct: f64) -> MarketSnapshot {
    MarketSnapshot {
        symbol: symbol.into(),
        bar_time: bar_time(),
        close,
        adx: 30.0,
        atr: 1.5,
        atr_pct,
        ema_fast: 101.0,
        ema_slow: 100.0,
        ema_fast_slope: 0.5,
        rsi: 55.0,
        bb_width: 0.04,
        vol_spike_mult: 1.2,
        volume_rank: 0,
    }
}

fn panic_benchmark() -> MarketSnapshot {
    MarketSnapshot {
        ema_fast: 99.0,
        ema_slow: 100.0,
        ema_fast_slope: -0.5,
        atr_pct: 2.0,
        ..uptrend("BTCUSDT", dec!(60000), 2.0)
    }
}

fn config(state_dir: &TempDir, symbols: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.symbols = symbols.iter().map(|s| (*s).to_string()).collect();
    config.engine.benchmark_symbol = "BTCUSDT".into();
    config.engine.state_dir = state_dir.path().to_path_buf();
    config.engine.decision_interval_secs = 1;
    config.retry = RetryPolicy::default().with_backoff_ms(1);
    config.stop_replace = StopReplaceConfig {
        confirm_attempts: 3,
        confirm_delay_ms: 5,
    };
    config
}

struct Harness {
    gateway: Arc<PaperGateway>,
    market: Arc<ScriptedMarket>,
    engine: Engine,
}

fn harness(config: AppConfig) -> Harness {
    let gateway = Arc::new(PaperGateway::new(dec!(10000)));
    gateway.set_mark_price("BTCUSDT", dec!(60000));
    gateway.set_mark_price("SOLUSDT", dec!(100));
    let market = Arc::new(ScriptedMarket::default());
    market.set(uptrend("BTCUSDT", dec!(60000), 1.0));
    market.set(uptrend("SOLUSDT", dec!(100), 1.5));
    let engine = Engine::new(config, gateway.clone(), market.clone(), Arc::new(LongEverything)).unwrap();
    Harness {
        gateway,
        market,
        engine,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_cycle_opens_protected_position() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["BTCUSDT", "SOLUSDT"]));
    let mut events = h.engine.subscribe();

    let report = h.engine.evaluate_cycle().await;
    assert_eq!(report.gate, MarketGate::Normal);
    assert!(!report.fuse_active);
    assert_eq!(report.equity, Some(dec!(10000)));

    // SOL sits inside the volatility sweet spot, the benchmark below it
    assert_eq!(report.candidates[0].symbol, "SOLUSDT");
    assert_eq!(report.candidates.len(), 2);
    let entry = report.entry.expect("entry attempted");
    assert_eq!(entry.symbol, "SOLUSDT");
    // 10k × 0.35% = 35 risked over a 2% stop -> 1750 notional
    match entry.outcome {
        EntryOutcome::Opened {
            quantity,
            entry_price,
            stop_price,
        } => {
            assert_eq!(quantity, dec!(17.5));
            assert_eq!(entry_price, dec!(100));
            assert_eq!(stop_price, dec!(98));
        }
        other => panic!("expected an entry, got {other:?}"),
    }

    let symbol = entry.symbol.clone();
    assert!(h.gateway.position_quantity(&symbol) > Decimal::ZERO);
    assert!(h
        .gateway
        .all_orders(&symbol)
        .iter()
        .any(|o| o.order_type == "STOP_MARKET"));

    let status = h.engine.status().await;
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.positions[0].symbol, symbol);
    assert_eq!(status.entry_gate.trades_today, 1);
    assert_eq!(status.portfolio.entries_this_bar, 1);

    let mut opened = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::EntryOpened { .. }) {
            opened = true;
        }
    }
    assert!(opened);

    // one entry per bar: the next cycle on the same bar opens nothing
    let again = h.engine.evaluate_cycle().await;
    match again.entry.map(|e| e.outcome) {
        None => {}
        Some(EntryOutcome::Denied { reason }) => assert!(reason.starts_with("max_"), "{reason}"),
        Some(other) => panic!("unexpected second entry: {other:?}"),
    }
}

#[tokio::test]
async fn test_restart_restores_lifecycle_and_gate() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    let report = h.engine.evaluate_cycle().await;
    assert!(matches!(
        report.entry.map(|e| e.outcome),
        Some(EntryOutcome::Opened { .. })
    ));

    let restarted = Engine::new(
        config(&dir, &["SOLUSDT"]),
        h.gateway.clone(),
        h.market.clone(),
        Arc::new(LongEverything),
    )
    .unwrap();
    assert_eq!(restarted.lifecycle().tracked_symbols(), vec!["SOLUSDT".to_string()]);
    let status = restarted.status().await;
    assert_eq!(status.entry_gate.trades_today, 1);
    assert_eq!(status.positions[0].stop_price, Some(dec!(98)));
}

#[tokio::test]
async fn test_crash_fuse_blocks_entries() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    *h.market.fuse_bar.lock() = Some(FuseBar {
        open: dec!(60000),
        last: dec!(59000),
        atr_pct: 0.002,
    });

    let report = h.engine.evaluate_cycle().await;
    assert!(report.fuse_active);
    assert_eq!(
        report.entry.map(|e| e.outcome),
        Some(EntryOutcome::Denied {
            reason: "crash_fuse".into()
        })
    );
    assert_eq!(h.gateway.position_quantity("SOLUSDT"), Decimal::ZERO);
}

#[tokio::test]
async fn test_panic_gate_refuses_longs() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    h.market.set(panic_benchmark());

    let report = h.engine.evaluate_cycle().await;
    assert_eq!(report.gate, MarketGate::Panic);
    assert_eq!(
        report.entry.map(|e| e.outcome),
        Some(EntryOutcome::Denied {
            reason: "panic_gate_no_longs".into()
        })
    );
}

#[tokio::test]
async fn test_repeated_placement_failures_trip_breaker() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    let mut events = h.engine.subscribe();
    h.gateway.fail_next_places(3);

    for _ in 0..3 {
        let report = h.engine.evaluate_cycle().await;
        assert!(matches!(
            report.entry.map(|e| e.outcome),
            Some(EntryOutcome::Failed { .. })
        ));
    }

    let status = h.engine.status().await;
    assert!(status.breaker_active);
    assert_eq!(status.breaker_reason.as_deref(), Some("execution_failures(3)"));

    let report = h.engine.evaluate_cycle().await;
    assert_eq!(
        report.entry.map(|e| e.outcome),
        Some(EntryOutcome::Denied {
            reason: "circuit_breaker(execution_failures(3))".into()
        })
    );

    let mut tripped = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::BreakerTripped { .. }) {
            tripped += 1;
        }
    }
    assert_eq!(tripped, 1);

    // only an operator clears the execution breaker
    h.engine.operator_reset().await.unwrap();
    assert!(!h.engine.status().await.breaker_active);
}

#[tokio::test]
async fn test_repeated_stop_move_failures_trip_breaker() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    let report = h.engine.evaluate_cycle().await;
    assert!(matches!(
        report.entry.map(|e| e.outcome),
        Some(EntryOutcome::Opened { .. })
    ));
    assert!(!h.engine.status().await.breaker_active);

    // +0.7% asks for the early-defense stop at 99.4; every placement fails
    h.gateway.set_mark_price("SOLUSDT", dec!(100.7));
    for _ in 0..3 {
        h.gateway.fail_next_places(1);
        let report = h.engine.evaluate_cycle().await;
        assert!(report.managed.is_empty());
        assert!(report.skipped.iter().any(|s| s.starts_with("manage(SOLUSDT)")), "{:?}", report.skipped);
    }

    let status = h.engine.status().await;
    assert!(status.breaker_active);
    assert_eq!(status.breaker_reason.as_deref(), Some("execution_failures(3)"));
    // the original stop is still the one protecting the position
    let stops: Vec<_> = h
        .gateway
        .all_orders("SOLUSDT")
        .into_iter()
        .filter(|o| o.order_type == "STOP_MARKET")
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].trigger_price, Some(dec!(98)));
}

#[tokio::test]
async fn test_reconcile_alerts_on_unprotected_position() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT", "ETHUSDT"]));
    h.gateway.seed_position("ETHUSDT", Side::Long, dec!(1), dec!(3000));
    let mut events = h.engine.subscribe();

    let reports = h.engine.reconcile_all().await;
    let eth = reports.iter().find(|r| r.symbol == "ETHUSDT").unwrap();
    assert!(matches!(eth.outcome, ReconcileOutcome::Unprotected { .. }));

    match events.try_recv() {
        Ok(EngineEvent::CriticalAlert { symbol, message, .. }) => {
            assert_eq!(symbol, "ETHUSDT");
            assert!(message.contains("no protective stop"));
        }
        other => panic!("expected critical alert, got {other:?}"),
    }
    // nothing was placed to repair it
    assert!(h.gateway.all_orders("ETHUSDT").is_empty());
}

#[tokio::test]
async fn test_stop_flag_short_circuits_cycle() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    h.engine.stop();
    let report = h.engine.evaluate_cycle().await;
    assert!(report.stopped);
    assert!(report.entry.is_none());
    assert_eq!(h.gateway.position_quantity("SOLUSDT"), Decimal::ZERO);
}

#[tokio::test]
async fn test_run_loops_exit_on_stop() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    let engine = Arc::new(h.engine);
    let stop = engine.stop_handle();
    let (tx, rx) = tokio::sync::mpsc::channel(4);

    let running = tokio::spawn(engine.clone().run(Some(rx)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.store(true, std::sync::atomic::Ordering::SeqCst);

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("loops did not stop")
        .unwrap()
        .unwrap();
    assert!(engine.status().await.cycles >= 1);
    drop(tx);
}

#[tokio::test]
async fn test_cycle_report_serializes() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir, &["SOLUSDT"]));
    let report = h.engine.evaluate_cycle().await;
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["gate"], "NORMAL");
    assert_eq!(json["regimes"]["SOLUSDT"], "UPTREND_LOWVOL");
}
