use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walbox_config::WalboxConfig;
use walbox_pg::Supervisor;

use crate::publisher::LogPublisher;

pub async fn cmd_run(config: WalboxConfig) -> Result<()> {
    info!(
        table = %config.outbox_table(),
        publication = %config.outbox.publication,
        "Starting walbox"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Received Ctrl-C, shutting down");
        shutdown.cancel();
    });

    Supervisor::new(config, Arc::new(LogPublisher))
        .run(cancel)
        .await
        .context("walbox stopped")?;

    Ok(())
}
