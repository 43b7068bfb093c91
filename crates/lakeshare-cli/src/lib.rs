//! # lakeshare-cli
//!
//! Operator command-line interface for lakeshare.
//!
//! ## Commands
//!
//! - `lakeshare simulate` - Run a scenario file against an in-memory deployment
//! - `lakeshare check-config` - Validate `LAKESHARE_*` configuration and show
//!   the buses and rules it deploys
//!
//! ## Configuration
//!
//! - `LAKESHARE_LOG_FORMAT` - `pretty` (default) or `json`; logs go to stderr
//! - `RUST_LOG` - log levels
//!
//! `check-config` reads every other `LAKESHARE_*` variable; `simulate` takes
//! its configuration from the scenario file.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod scenario;

use clap::{Parser, Subcommand};

use lakeshare_core::LogFormat;

/// Lakeshare CLI - cross-account grant orchestration tooling.
#[derive(Debug, Parser)]
#[command(name = "lakeshare")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Log format (`pretty` or `json`).
    #[arg(long, env = "LAKESHARE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a scenario against an in-memory deployment.
    Simulate(commands::simulate::SimulateArgs),
    /// Validate configuration from the environment.
    CheckConfig(commands::check_config::CheckConfigArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::parse_from([
            "lakeshare",
            "--format",
            "json",
            "--log-format",
            "json",
            "simulate",
            "--scenario",
            "scenario.json",
        ]);

        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.scenario.to_str(), Some("scenario.json"));
            }
            Commands::CheckConfig(_) => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        let result = Cli::try_parse_from(["lakeshare", "--log-format", "xml", "check-config"]);
        assert!(result.is_err());
    }
}
