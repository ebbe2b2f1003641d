//! Periodic repair of drift between the local cache and exchange truth.
//!
//! Uses its own REST snapshot as ground truth for each pass. The push feed is
//! never consulted here.

use chrono::{DateTime, Utc};
use riskgate_core::config::ReconcileConfig;
use riskgate_core::order_class::{classify, OrderClass};
use riskgate_core::shutdown::sleep_or_stop;
use riskgate_core::{retry_call, ExchangeGateway, GatewayError, RetryPolicy, Side};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::state_store::StateStore;
use crate::stop_replacer::{CancelSummary, StopReplacer};
use crate::symbol_locks::SymbolLocks;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Consistent,
    /// Flat position with leftover reduce-only orders, now cancelled.
    ZombieOrdersCleared {
        protective: Vec<String>,
        targets: Vec<String>,
        failed: Vec<String>,
    },
    /// Open position with no protective stop. Alerted, not repaired.
    Unprotected { side: Side, quantity: Decimal },
    /// Snapshot could not be taken; nothing was changed.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub symbol: String,
    pub outcome: ReconcileOutcome,
    pub checked_at: DateTime<Utc>,
}

impl ReconcileReport {
    /// True for outcomes that need a human.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self.outcome, ReconcileOutcome::Unprotected { .. })
    }
}

pub struct Reconciler {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<StateStore>,
    locks: Arc<SymbolLocks>,
    replacer: Arc<StopReplacer>,
    config: ReconcileConfig,
    retry: RetryPolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<StateStore>,
        locks: Arc<SymbolLocks>,
        replacer: Arc<StopReplacer>,
        config: ReconcileConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            locks,
            replacer,
            config,
            retry,
        }
    }

    /// Re-derives position and open orders of `symbol` and repairs what is safe to repair.
    pub async fn reconcile(&self, symbol: &str) -> ReconcileReport {
        // waits out any in-flight replace so a half-finished swap is never judged
        let _guard = self.locks.lock(symbol).await;
        let now = Utc::now();
        let report = |outcome| ReconcileReport {
            symbol: symbol.to_string(),
            outcome,
            checked_at: now,
        };

        let snapshot = async {
            let position = retry_call(self.retry, "get_position", || self.gateway.get_position(symbol)).await?;
            let orders = retry_call(self.retry, "get_open_orders", || self.gateway.get_open_orders(symbol)).await?;
            Ok::<_, GatewayError>((position, orders))
        };
        let (position, orders) = match snapshot.await {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "reconcile skipped, snapshot failed");
                return report(ReconcileOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
        };

        self.store.upsert_position(position.clone(), now);
        self.store.set_orders_snapshot(symbol, orders.clone(), now);

        let has_protective = orders.iter().any(|o| classify(o) == OrderClass::Protective);

        if position.is_flat() {
            let has_targets = self.config.clear_targets_when_flat
                && orders.iter().any(|o| classify(o) == OrderClass::Target);
            if !has_protective && !has_targets {
                return report(ReconcileOutcome::Consistent);
            }

            // with no position every reduce-only order is stale
            let cleared = async {
                let stops = self
                    .replacer
                    .cancel_classified(symbol, OrderClass::Protective, None)
                    .await?;
                let targets = if has_targets {
                    self.replacer
                        .cancel_classified(symbol, OrderClass::Target, None)
                        .await?
                } else {
                    CancelSummary::default()
                };
                Ok::<_, GatewayError>((stops, targets))
            };
            let (stops, targets) = match cleared.await {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "zombie cleanup skipped");
                    return report(ReconcileOutcome::Skipped {
                        reason: e.to_string(),
                    });
                }
            };
            info!(
                symbol = %symbol,
                protective = stops.cancelled.len(),
                targets = targets.cancelled.len(),
                failed = stops.failed.len() + targets.failed.len(),
                "cleared orders left behind by a closed position"
            );
            let mut failed = stops.failed;
            failed.extend(targets.failed);
            return report(ReconcileOutcome::ZombieOrdersCleared {
                protective: stops.cancelled,
                targets: targets.cancelled,
                failed,
            });
        }

        if !has_protective {
            let side = position.side.unwrap_or(Side::Long);
            error!(
                alert = true,
                symbol = %symbol,
                side = %side,
                quantity = %position.quantity,
                "CRITICAL: open position has no protective stop"
            );
            return report(ReconcileOutcome::Unprotected {
                side,
                quantity: position.quantity,
            });
        }

        report(ReconcileOutcome::Consistent)
    }

    pub async fn reconcile_all(&self, symbols: &[String]) -> Vec<ReconcileReport> {
        let mut reports = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            reports.push(self.reconcile(symbol).await);
        }
        reports
    }

    /// Reconciles every `interval_secs` until `stop` is set.
    ///
    /// `symbols` is asked for the symbol set on each tick, so positions
    /// opened after start are picked up. `on_report` sees every report,
    /// e.g. to forward critical ones as alerts.
    pub async fn run<S, F>(&self, symbols: S, stop: Arc<AtomicBool>, mut on_report: F)
    where
        S: Fn() -> Vec<String> + Send,
        F: FnMut(&ReconcileReport) + Send,
    {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(interval_secs = self.config.interval_secs, "reconciler started");
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let tick = symbols();
            debug!(symbols = tick.len(), "reconcile tick");
            for report in self.reconcile_all(&tick).await {
                on_report(&report);
            }
            if !sleep_or_stop(&stop, interval).await {
                break;
            }
        }
        info!("reconciler stopped");
    }
}
