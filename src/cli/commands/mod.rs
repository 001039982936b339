//! Subcommand implementations.

pub mod inventory;
pub mod serve;

use runway::config::Config;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
}

impl CommandContext {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}
