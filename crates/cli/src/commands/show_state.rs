//! `show-state`: dump what a stopped engine would restore on its next start.

use anyhow::Result;
use clap::Args;
use riskgate_core::JsonStore;
use riskgate_orchestrator::records::ENTRY_GATE_FILE;
use riskgate_orchestrator::PositionRecordStore;
use riskgate_strategy::{EntryGateRecord, PositionRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct ShowStateArgs {
    /// Engine state directory
    #[arg(long, default_value = "state", env = "RISKGATE_STATE_DIR")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct PersistedState {
    state_dir: PathBuf,
    positions: Vec<PositionRecord>,
    entry_gate: Option<EntryGateRecord>,
}

fn read_state(state_dir: &Path) -> PersistedState {
    PersistedState {
        state_dir: state_dir.to_path_buf(),
        positions: PositionRecordStore::in_dir(state_dir).load(),
        entry_gate: JsonStore::<EntryGateRecord>::new(state_dir.join(ENTRY_GATE_FILE)).load(),
    }
}

/// Prints persisted position records and the entry gate record as JSON.
///
/// # Errors
/// Returns error if the output cannot be serialized.
pub fn run_show_state(args: &ShowStateArgs) -> Result<()> {
    if !args.state_dir.is_dir() {
        tracing::warn!(path = %args.state_dir.display(), "State directory does not exist");
    }
    let state = read_state(&args.state_dir);
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
