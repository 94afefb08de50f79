//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - synth: write a scenario's templates, manifest and assets
//! - list: list scenarios and their stacks
//! - exports: list a scenario's cross-stack exports

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ecs_infra::scenario::Scenario;

/// Synthesize CloudFormation for ECS deployment scenarios
#[derive(Parser, Debug)]
#[command(name = "ecs-infra")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write templates, manifest and assets for a scenario
    Synth {
        /// Scenario to synthesize
        #[arg(value_enum)]
        scenario: Scenario,

        /// Output directory
        #[arg(short, long, default_value = "cdk.out")]
        output: PathBuf,
    },

    /// List scenarios and the stacks each defines
    List,

    /// List every export of a scenario and the stack that owns it
    Exports {
        /// Scenario to inspect
        #[arg(value_enum)]
        scenario: Scenario,
    },
}
