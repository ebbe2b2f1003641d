//! User-stream consumer.
//!
//! Push events are only used to refresh "last seen" bookkeeping. Positions and
//! orders are never mutated from the stream; the reconciler owns that.

use riskgate_core::ExchangeEvent;
use riskgate_execution::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const RECV_POLL: Duration = Duration::from_millis(200);

/// Drains `rx` until the channel closes or `stop` is set. Returns the number
/// of events seen.
pub async fn listen(store: Arc<StateStore>, mut rx: mpsc::Receiver<ExchangeEvent>, stop: Arc<AtomicBool>) -> u64 {
    info!("event listener started");
    let mut seen = 0u64;
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match tokio::time::timeout(RECV_POLL, rx.recv()).await {
            Ok(Some(event)) => {
                debug!(symbol = %event.symbol(), at = %event.event_time(), "user stream event");
                store.record_event_seen(event.symbol(), event.event_time());
                seen += 1;
            }
            Ok(None) => {
                info!("user stream closed");
                break;
            }
            Err(_) => {}
        }
    }
    info!(events = seen, "event listener stopped");
    seen
}
