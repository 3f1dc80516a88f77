//! CLI module for the Halldyll provisioning tool.
//!
//! This module provides the command-line interface: argument parsing and
//! output formatting. Command handlers live in the binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, RunArgs, StateCommands};
pub use output::OutputFormatter;
