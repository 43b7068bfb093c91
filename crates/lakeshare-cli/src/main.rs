//! Lakeshare CLI - operator command-line interface.
//!
//! The main entry point for the `lakeshare` binary.

use anyhow::Result;
use clap::Parser;

use lakeshare_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    lakeshare_core::init_logging(cli.log_format);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Simulate(args) => {
                lakeshare_cli::commands::simulate::execute(args, &cli.format).await
            }
            Commands::CheckConfig(args) => {
                lakeshare_cli::commands::check_config::execute(&args, &cli.format)
            }
        }
    })
}
