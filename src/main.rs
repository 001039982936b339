//! Runway command-line entry point.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use runway::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config = Config::load(cli.config.as_deref())?;
    runway::logging::init(&config.logging, cli.verbosity())?;

    let mut ctx = CommandContext::new(config);

    let exit_code = match &cli.command {
        Commands::Serve(args) => args.execute(&mut ctx).await?,
        Commands::Inventory(args) => args.execute(&mut ctx).await?,
    };

    std::process::exit(exit_code);
}
