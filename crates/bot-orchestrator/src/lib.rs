//! Wires the engine together: the decision cycle, the reconciler loop, the
//! user-stream listener, position-record persistence and status reporting.

pub mod engine;
pub mod events;
pub mod listener;
pub mod records;

pub use engine::Engine;
pub use events::{alert_message, CycleReport, EngineEvent, EngineStatus, EntryAttempt, EntryOutcome};
pub use listener::listen;
pub use records::PositionRecordStore;
