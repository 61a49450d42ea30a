//! Command-line interface for Portolan
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::manifest::DEFAULT_SETTINGS_PATH;

/// Portolan - declarative network interface orchestrator
#[derive(Parser)]
#[command(name = "portolan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate a network configuration without touching the system
    Check {
        /// JSON network configuration file
        file: PathBuf,
    },

    /// Show the operations applying a configuration would run
    Plan {
        /// JSON network configuration file
        file: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Apply a network configuration and make it the active one
    Apply {
        /// JSON network configuration file
        file: PathBuf,

        /// Output errors in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the active network configuration
    Active,

    /// Show the operational state of configured interfaces
    State {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Whether the command changes kernel state and needs root
    pub fn mutates_kernel(&self) -> bool {
        matches!(self, Commands::Apply { .. })
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "portolan", &mut std::io::stdout());
    }
}
