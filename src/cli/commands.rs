//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halldyll - Declarative infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "halldyll")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "HALLDYLL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

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
    /// Initialize a new Halldyll project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and the resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan without changing anything.
    Plan {
        /// Show attribute changes of every action.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Run settings.
        #[command(flatten)]
        run: RunArgs,
    },

    /// Delete every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Run settings.
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show the dependency graph.
    Graph {
        /// Emit Graphviz DOT instead of levels.
        #[arg(long)]
        dot: bool,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Execution overrides shared by `apply` and `destroy`.
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct RunArgs {
    /// Maximum number of provider calls in flight.
    #[arg(long, env = "HALLDYLL_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Deadline for each provider call, in seconds.
    #[arg(long, env = "HALLDYLL_TIMEOUT_SECS")]
    pub timeout: Option<u64>,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded resources.
    List,

    /// Show one recorded resource.
    Show {
        /// Resource as `kind.name`.
        resource: String,
    },

    /// Forget a resource without deleting it.
    Rm {
        /// Resource as `kind.name`.
        resource: String,
    },

    /// Lock the state.
    Lock {
        /// Operation recorded in the lock.
        #[arg(long, default_value = "manual")]
        operation: String,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
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
