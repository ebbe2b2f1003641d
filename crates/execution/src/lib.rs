//! Order-side machinery: the state cache, per-symbol locks, atomic stop
//! replacement, reconciliation and reduce-only exits.

pub mod executor;
pub mod filters;
pub mod paper;
pub mod reconciler;
pub mod state_store;
pub mod stop_replacer;
pub mod symbol_locks;

pub use executor::{CloseFill, EntryFill, ExecutionError, OrderExecutor};
pub use filters::{floor_to_step, normalize_quantity, round_stop_to_tick, SizingRejection};
pub use paper::{PaperFill, PaperGateway, ProtectionSample};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use state_store::{StateStore, StoreInner};
pub use stop_replacer::{CancelSummary, StopReplaceError, StopReplacement, StopReplacer};
pub use symbol_locks::{SymbolGuard, SymbolLocks};
