use chrono::{DateTime, Utc};
use riskgate_core::{MarketGate, Regime, Side};
use riskgate_execution::ReconcileReport;
use riskgate_selector::{CandidateScore, FilterRejection};
use riskgate_strategy::{ClosedTrade, EntryGateRecord, FuseStatus, ManageReport, PortfolioRiskState, PositionRecord};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Published on the engine's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    CycleCompleted {
        cycle: u64,
        at: DateTime<Utc>,
    },

    EntryOpened {
        symbol: String,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
    },

    PositionClosed(ClosedTrade),

    StopMoved {
        symbol: String,
        order_id: String,
        stop_price: Decimal,
    },

    /// Needs a human: unprotected position, failed protection, zombie stop.
    CriticalAlert {
        symbol: String,
        message: String,
        at: DateTime<Utc>,
    },

    BreakerTripped {
        reason: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Opened {
        quantity: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
    },
    /// Refused by a risk check; `reason` is the check's reason string.
    Denied { reason: String },
    Failed { error: String },
}

/// What happened to the top-ranked candidate of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryAttempt {
    pub symbol: String,
    pub side: Side,
    pub signal_type: String,
    pub score: f64,
    pub outcome: EntryOutcome,
}

/// Everything one decision cycle observed and did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub equity: Option<Decimal>,
    pub gate: MarketGate,
    pub fuse_active: bool,
    pub regimes: BTreeMap<String, Regime>,
    pub managed: Vec<ManageReport>,
    pub candidates: Vec<CandidateScore>,
    pub rejected: Vec<(String, FilterRejection)>,
    pub entry: Option<EntryAttempt>,
    /// Steps skipped on transient failures, as `step(symbol): error`.
    pub skipped: Vec<String>,
    /// Set when the stop flag was already raised; nothing else ran.
    pub stopped: bool,
}

impl CycleReport {
    #[must_use]
    pub fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            equity: None,
            gate: MarketGate::Normal,
            fuse_active: false,
            regimes: BTreeMap::new(),
            managed: Vec::new(),
            candidates: Vec::new(),
            rejected: Vec::new(),
            entry: None,
            skipped: Vec::new(),
            stopped: false,
        }
    }

    pub(crate) fn skip(&mut self, step: &str, symbol: &str, error: impl std::fmt::Display) {
        self.skipped.push(format!("{step}({symbol}): {error}"));
    }
}

/// Health snapshot for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub cycles: u64,
    pub stopped: bool,
    pub breaker_active: bool,
    pub breaker_reason: Option<String>,
    pub gate: MarketGate,
    pub fuse: FuseStatus,
    pub regimes: BTreeMap<String, Regime>,
    pub positions: Vec<PositionRecord>,
    /// Held symbols with neither a push event nor a snapshot inside the stale window.
    pub stale_symbols: Vec<String>,
    pub portfolio: PortfolioRiskState,
    pub entry_gate: EntryGateRecord,
    pub fee_ratio: Option<Decimal>,
}

/// Alert text for a reconcile report that needs attention.
#[must_use]
pub fn alert_message(report: &ReconcileReport) -> Option<String> {
    use riskgate_execution::ReconcileOutcome;
    match &report.outcome {
        ReconcileOutcome::Unprotected { side, quantity } => {
            Some(format!("{side} position of {quantity} has no protective stop"))
        }
        ReconcileOutcome::ZombieOrdersCleared { failed, .. } if !failed.is_empty() => Some(format!(
            "flat position still has reduce-only orders that failed to cancel: {}",
            failed.join(", ")
        )),
        _ => None,
    }
}
