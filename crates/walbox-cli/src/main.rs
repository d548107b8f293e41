use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use walbox_config::WalboxConfig;

mod cli;
mod commands;
mod env;
mod publisher;

use cli::{Cli, Commands};
use env::load_dotenv_from_ancestors;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("walbox=info".parse()?),
        )
        .init();

    if let Some(path) = load_dotenv_from_ancestors()? {
        info!("Loaded .env from {}", path.display());
    }

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => commands::cmd_run(config).await,
        Commands::Check => commands::cmd_check(config).await,
    }
}

fn load_config(path: &Path) -> Result<WalboxConfig> {
    let config = if path.exists() {
        WalboxConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?
    } else {
        debug!(path = %path.display(), "Config file not found, using environment");
        WalboxConfig::from_env().context("Failed to build config from environment")?
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
