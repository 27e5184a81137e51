//! CLI module for infraplan.
//!
//! This module provides the command-line interface for planning and
//! applying declarations.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
