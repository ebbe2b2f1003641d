use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-symbol mutation locks.
///
/// Stop replacement, entries and closes for one symbol never interleave;
/// different symbols proceed in parallel.
#[derive(Debug, Default)]
pub struct SymbolLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the caller holds the mutation lock for `symbol`.
#[derive(Debug)]
pub struct SymbolGuard {
    symbol: String,
    _guard: OwnedMutexGuard<()>,
}

impl SymbolGuard {
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl SymbolLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for the lock of `symbol`.
    pub async fn lock(&self, symbol: &str) -> SymbolGuard {
        let guard = self.handle(symbol).lock_owned().await;
        SymbolGuard {
            symbol: symbol.to_string(),
            _guard: guard,
        }
    }

    /// Takes the lock only if nobody holds it.
    #[must_use]
    pub fn try_lock(&self, symbol: &str) -> Option<SymbolGuard> {
        let guard = self.handle(symbol).try_lock_owned().ok()?;
        Some(SymbolGuard {
            symbol: symbol.to_string(),
            _guard: guard,
        })
    }
}
