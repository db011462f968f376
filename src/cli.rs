use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Capability resolver - replay and inspect feature binding scenarios
#[derive(Parser)]
#[command(name = "capability-resolver")]
#[command(about = "Resolves which service package provides each feature on each slot")]
#[command(version)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a scenario file and print the final state
    Simulate {
        /// Path to the scenario JSON file
        scenario: PathBuf,

        /// What to print
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },
    /// Validate a scenario file
    Validate {
        /// Path to the scenario JSON file
        scenario: PathBuf,
    },
    /// Replay a scenario and explain who governs and owns each feature
    Explain {
        /// Path to the scenario JSON file
        scenario: PathBuf,
    },
}

/// Output of the `simulate` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Full report as pretty JSON
    Json,
    /// Controller calls, one per line
    Journal,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
