//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// infraplan - Declarative dependency resolution and convergence planner.
#[derive(Parser, Debug)]
#[command(name = "infraplan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the declaration file.
    #[arg(short, long, global = true, env = "INFRAPLAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the declarations.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan.
    Plan {
        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Compute the plan and apply it.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Override the number of concurrent provider calls.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show the dependency graph as waves of resources.
    Graph,

    /// Check whether provider objects still match state.
    Drift,

    /// Delete every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect or edit the state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Remove an address from state without deleting its object.
    Rm {
        /// Address to remove (e.g. `aws_subnet.public_a`).
        address: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_overrides() {
        let cli = Cli::try_parse_from([
            "infraplan", "--output", "json", "apply", "--yes", "--workers", "8",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Apply {
                yes: true,
                workers: Some(8)
            }
        ));
    }

    #[test]
    fn test_parse_state_rm() {
        let cli = Cli::try_parse_from(["infraplan", "state", "rm", "aws_subnet.a", "-v"]).unwrap();
        assert!(cli.verbose);
        let Commands::State {
            command: StateCommands::Rm { address },
        } = cli.command
        else {
            panic!("expected state rm");
        };
        assert_eq!(address, "aws_subnet.a");
    }
}
