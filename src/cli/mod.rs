//! Command-line interface for forge-queue.
//!
//! Provides offline commands for feeding, inspecting and compacting
//! persistent queues.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
