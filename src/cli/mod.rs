//! Command-line interface for proxyscale.
//!
//! Provides the `run`, `once`, and `teardown` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
