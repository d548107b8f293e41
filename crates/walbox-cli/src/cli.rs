use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Outbox delivery over Postgres logical replication.
#[derive(Parser)]
#[command(name = "walbox", version)]
pub struct Cli {
    /// Config file; when it does not exist the connection comes from DATABASE_URL or DB_*
    #[arg(short, long, global = true, default_value = "walbox.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream the outbox and publish each inserted row until interrupted
    Run,

    /// Report whether the server and outbox table are set up for streaming
    Check,
}
