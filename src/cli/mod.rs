//! Command-line interface for lockqueue.
//!
//! Provides commands for running workers, submitting and inspecting jobs,
//! and reporting queue state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
