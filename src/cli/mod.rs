//! CLI module for ecs-infra - argument parsing and subcommands.

pub mod commands;

pub use commands::Cli;
