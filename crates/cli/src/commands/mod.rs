//! Subcommands of the `riskgate` binary.

pub mod check_config;
pub mod replay;
pub mod show_state;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use replay::{run_replay, ReplayArgs};
pub use show_state::{run_show_state, ShowStateArgs};
