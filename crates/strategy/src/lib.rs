//! Decision layer: regime classification, portfolio risk gating, entry
//! throttling and the staged exit state machine for open positions.

pub mod entry_gate;
pub mod fee_guard;
pub mod fuse;
pub mod lifecycle;
pub mod portfolio;
pub mod regime;

pub use entry_gate::{EntryGate, EntryGateRecord, GateDenial};
pub use fee_guard::{FeeRatioExceeded, FeeRatioGuard, TradeCost};
pub use fuse::{CrashFuse, FuseStatus};
pub use lifecycle::{
    decide, ClosedTrade, ExitReason, LifecycleAction, LifecycleError, LifecycleInputs, LifecycleManager,
    LifecycleState, ManageContext, ManageReport, PositionRecord, StopOverlay,
};
pub use portfolio::{decision_reason, EntryDenial, PortfolioRiskManager, PortfolioRiskState};
pub use regime::{
    stabilize, EffectiveSettings, GateReading, MarketGateState, RegimeDetector, RegimeReading, RegimeState,
};
