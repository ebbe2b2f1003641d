//! `replay`: feed recorded market steps through a full engine wired to the
//! paper exchange, printing one cycle report per step.
//!
//! The input is a JSON document:
//!
//! ```json
//! {
//!   "balance": "10000",
//!   "steps": [
//!     {
//!       "marks": { "SOLUSDT": "100" },
//!       "snapshots": [ { "symbol": "SOLUSDT", "bar_time": "...", "close": "100", ... } ],
//!       "fuse_bar": { "open": "60000", "last": "59900", "atr_pct": 0.002 },
//!       "signals": [ { "symbol": "SOLUSDT", "side": "long", ... } ]
//!     }
//!   ]
//! }
//! ```
//!
//! Before each cycle the step's marks are applied and any resting stop or
//! target they cross is filled, so exits happen the way they would on the
//! exchange.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use parking_lot::Mutex;
use riskgate_core::{
    ConfigLoader, EntrySignal, FuseBar, MarketDataProvider, MarketSnapshot, RegimeView, SignalSource,
};
use riskgate_execution::PaperGateway;
use riskgate_orchestrator::{CycleReport, Engine, EngineStatus};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Config file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/riskgate.toml", env = "RISKGATE_CONFIG")]
    pub config: PathBuf,

    /// Recorded steps to replay
    #[arg(short, long)]
    pub input: PathBuf,

    /// State directory for the replay; overrides `engine.state_dir`
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

fn default_balance() -> Decimal {
    Decimal::new(10_000, 0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    #[serde(default = "default_balance")]
    pub balance: Decimal,
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayStep {
    pub marks: BTreeMap<String, Decimal>,
    pub snapshots: Vec<MarketSnapshot>,
    pub fuse_bar: Option<FuseBar>,
    pub signals: Vec<EntrySignal>,
}

// ============================================================================
// Recorded feed
// ============================================================================

/// Serves the current step's snapshots and signals to the engine.
#[derive(Default)]
struct ReplayFeed {
    step: Mutex<ReplayStep>,
}

impl ReplayFeed {
    fn advance(&self, step: ReplayStep) {
        *self.step.lock() = step;
    }
}

#[async_trait]
impl MarketDataProvider for ReplayFeed {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        self.step
            .lock()
            .snapshots
            .iter()
            .find(|s| s.symbol == symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no recorded snapshot for {symbol}"))
    }

    async fn fuse_bar(&self, _symbol: &str) -> Result<Option<FuseBar>> {
        Ok(self.step.lock().fuse_bar.clone())
    }
}

impl SignalSource for ReplayFeed {
    fn evaluate(&self, snapshot: &MarketSnapshot, _regime: &RegimeView) -> Option<EntrySignal> {
        self.step
            .lock()
            .signals
            .iter()
            .find(|s| s.symbol == snapshot.symbol)
            .cloned()
    }

    fn name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Runs every step of `script` through `engine`, one decision cycle per step.
async fn replay(
    engine: &Engine,
    gateway: &PaperGateway,
    feed: &ReplayFeed,
    script: ReplayScript,
) -> (Vec<CycleReport>, EngineStatus) {
    let mut reports = Vec::with_capacity(script.steps.len());
    for step in script.steps {
        for (symbol, mark) in &step.marks {
            gateway.set_mark_price(symbol, *mark);
            let fills = gateway.trigger_orders(symbol);
            if !fills.is_empty() {
                info!(symbol = %symbol, fills = fills.len(), mark = %mark, "Resting orders triggered");
            }
        }
        feed.advance(step);
        reports.push(engine.evaluate_cycle().await);
    }
    (reports, engine.status().await)
}

/// Replays the input file and prints each cycle report, then the final
/// engine status, as JSON lines.
///
/// # Errors
/// Returns error if the config or the input cannot be loaded.
pub async fn run_replay(args: ReplayArgs) -> Result<()> {
    let mut config = ConfigLoader::load(&args.config)?;
    if let Some(dir) = args.state_dir {
        config.engine.state_dir = dir;
    }

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let script: ReplayScript =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", args.input.display()))?;
    if script.steps.is_empty() {
        warn!(path = %args.input.display(), "Replay input has no steps");
    }
    info!(steps = script.steps.len(), balance = %script.balance, "Starting replay");

    let gateway = Arc::new(PaperGateway::new(script.balance));
    let feed = Arc::new(ReplayFeed::default());
    let engine = Engine::new(config, gateway.clone(), feed.clone(), feed.clone())?;

    let (reports, status) = replay(&engine, &gateway, &feed, script).await;
    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskgate_core::AppConfig;
    use riskgate_orchestrator::EntryOutcome;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn script() -> ReplayScript {
        let snapshot = serde_json::json!({
            "symbol": "SOLUSDT",
            "bar_time": "2024-03-01T01:00:00Z",
            "close": "100",
            "adx": 30.0,
            "atr": 1.5,
            "atr_pct": 1.5,
            "ema_fast": 101.0,
            "ema_slow": 100.0,
            "ema_fast_slope": 0.5
        });
        let benchmark = serde_json::json!({
            "symbol": "BTCUSDT",
            "bar_time": "2024-03-01T01:00:00Z",
            "close": "60000",
            "adx": 30.0,
            "atr": 600.0,
            "atr_pct": 1.0,
            "ema_fast": 101.0,
            "ema_slow": 100.0,
            "ema_fast_slope": 0.5
        });
        let signal = serde_json::json!({
            "symbol": "SOLUSDT",
            "side": "long",
            "signal_type": "pullback",
            "timeframe": "15m",
            "bar_time": "2024-03-01T01:00:00Z",
            "entry_ref": "100",
            "stop_price": "98"
        });
        serde_json::from_value(serde_json::json!({
            "steps": [
                {
                    "marks": { "BTCUSDT": "60000", "SOLUSDT": "100" },
                    "snapshots": [benchmark.clone(), snapshot.clone()],
                    "signals": [signal]
                },
                {
                    "marks": { "BTCUSDT": "60000", "SOLUSDT": "97" },
                    "snapshots": [benchmark, snapshot]
                }
            ]
        }))
        .unwrap()
    }

    fn engine(dir: &TempDir, gateway: Arc<PaperGateway>, feed: Arc<ReplayFeed>) -> Engine {
        let mut config = AppConfig::default();
        config.engine.symbols = vec!["SOLUSDT".into()];
        config.engine.state_dir = dir.path().to_path_buf();
        config.retry = config.retry.with_backoff_ms(1);
        config.stop_replace.confirm_delay_ms = 5;
        Engine::new(config, gateway, feed.clone(), feed).unwrap()
    }

    #[test]
    fn test_script_defaults() {
        let script: ReplayScript = serde_json::from_str(r#"{"steps":[{}]}"#).unwrap();
        assert_eq!(script.balance, dec!(10000));
        assert!(script.steps[0].snapshots.is_empty());
        assert!(script.steps[0].fuse_bar.is_none());
    }

    #[tokio::test]
    async fn test_replay_opens_then_stops_out() {
        let dir = TempDir::new().unwrap();
        let script = script();
        let gateway = Arc::new(PaperGateway::new(script.balance));
        let feed = Arc::new(ReplayFeed::default());
        let engine = engine(&dir, gateway.clone(), feed.clone());

        let (reports, status) = replay(&engine, &gateway, &feed, script).await;
        assert_eq!(reports.len(), 2);
        let entry = reports[0].entry.as_ref().unwrap();
        assert!(matches!(entry.outcome, EntryOutcome::Opened { .. }), "{:?}", entry.outcome);

        // the 97 mark crosses the 98 stop before the second cycle
        assert_eq!(gateway.position_quantity("SOLUSDT"), Decimal::ZERO);
        assert!(status.positions.is_empty());
        assert_eq!(status.entry_gate.trades_today, 1);
    }
}
