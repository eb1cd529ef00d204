//! Command-line interface.

pub mod commands;
pub mod output;
pub mod types;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::storage::StateLayout;

pub use output::CommandOutput;
pub use types::{Cli, Commands};

/// Loaded configuration plus the state layout it points at.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Config,
    pub layout: StateLayout,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let layout = StateLayout::new(config.paths.state_dir.clone());
        Self { config, layout }
    }

    /// Load configuration for a CLI invocation.
    pub fn load(config_path: Option<&PathBuf>, state_dir: Option<&PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => ConfigLoader::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ConfigLoader::load().context("Failed to load configuration")?,
        };
        if let Some(dir) = state_dir {
            config.paths.state_dir.clone_from(dir);
        }
        Ok(Self::new(config))
    }
}

/// Run the parsed command and return its output.
pub async fn run(cli: Cli, ctx: &AppContext) -> Result<CommandOutput> {
    match cli.command {
        Commands::Dispatch { cycles, owner } => commands::dispatch::execute(ctx, cycles, owner).await,
        Commands::Job(cmd) => commands::job::execute(ctx, cmd),
        Commands::Council(cmd) => commands::council::execute(ctx, cmd).await,
        Commands::Bus(cmd) => commands::bus::execute(ctx, cmd),
        Commands::Route(cmd) => commands::route::execute(ctx, cmd).await,
        Commands::Breaker(cmd) => commands::breaker::execute(ctx, cmd),
        Commands::Governance(cmd) => commands::governance::execute(ctx, cmd),
    }
}
