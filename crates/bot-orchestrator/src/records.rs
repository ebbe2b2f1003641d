use riskgate_core::{JsonStore, PersistenceError};
use riskgate_strategy::PositionRecord;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const POSITIONS_FILE: &str = "positions.json";
pub const ENTRY_GATE_FILE: &str = "entry_gate.json";

/// JSON map of symbol to [`PositionRecord`], rewritten after every lifecycle change.
///
/// Restores TP1/stop progress across restarts so a restarted engine does not
/// take the first partial profit twice.
#[derive(Debug, Clone)]
pub struct PositionRecordStore {
    store: JsonStore<BTreeMap<String, PositionRecord>>,
}

impl PositionRecordStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Store at the conventional file name inside `state_dir`.
    #[must_use]
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(POSITIONS_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// All persisted records, sorted by symbol. Missing or unreadable files load as empty.
    #[must_use]
    pub fn load(&self) -> Vec<PositionRecord> {
        self.store
            .load()
            .map(|map| map.into_values().collect())
            .unwrap_or_default()
    }

    /// Replaces the file contents with `records`.
    ///
    /// # Errors
    /// Returns the underlying IO or serialization error.
    pub fn save_all(&self, records: &[PositionRecord]) -> Result<(), PersistenceError> {
        let map: BTreeMap<String, PositionRecord> = records
            .iter()
            .map(|r| (r.symbol.clone(), r.clone()))
            .collect();
        self.store.save(&map)
    }
}
