//! Command-line interface for imagepipe.
//!
//! Provides the worker, scaler, submit and queue-status commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
