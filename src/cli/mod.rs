//! Command-line interface for Runway.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Runway - remote execution over SSH behind an HTTP API
#[derive(Parser, Debug, Clone)]
#[command(name = "runway")]
#[command(version)]
#[command(about = "Remote execution over SSH behind an HTTP API", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the HTTP API server
    Serve(commands::serve::ServeArgs),

    /// Query the dynamic inventory cache
    Inventory(commands::inventory::InventoryArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_parsing() {
        let cli = Cli::try_parse_from(["runway", "serve", "--bind", "127.0.0.1:9000"]).unwrap();
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.bind, Some("127.0.0.1:9000".parse().unwrap())),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_verbosity_and_config() {
        let cli = Cli::try_parse_from(["runway", "-vvvv", "-c", "/etc/runway.toml", "inventory"]).unwrap();
        assert_eq!(cli.verbosity(), 3);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/runway.toml")));
    }

    #[test]
    fn test_inventory_flags() {
        let cli = Cli::try_parse_from(["runway", "inventory", "--host", "web1"]).unwrap();
        match cli.command {
            Commands::Inventory(args) => assert_eq!(args.host.as_deref(), Some("web1")),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["runway", "inventory", "--list", "--host", "web1"]).is_err());
    }
}
