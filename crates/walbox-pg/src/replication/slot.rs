//! Replication slot naming and cleanup.

use tokio_postgres::Client;
use tracing::{info, warn};

use crate::error::PgResult;

/// Name for a fresh temporary slot: `<prefix>_<uuid without dashes>`.
pub fn temporary_slot_name(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// List inactive replication slots whose name starts with `prefix`.
pub async fn inactive_slots(client: &Client, prefix: &str) -> PgResult<Vec<String>> {
    let rows = client
        .query(
            "SELECT slot_name::text FROM pg_replication_slots WHERE NOT active ORDER BY slot_name",
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| r.get::<_, String>(0))
        .filter(|name| name.starts_with(prefix))
        .collect())
}

/// Drop a replication slot.
pub async fn drop_slot(client: &Client, slot_name: &str) -> PgResult<()> {
    client
        .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
        .await?;
    Ok(())
}

/// Drop every inactive slot carrying our prefix. Returns the slots dropped.
///
/// A slot that fails to drop (for example because it became active meanwhile) is logged
/// and skipped.
pub async fn drop_inactive_slots(client: &Client, prefix: &str) -> PgResult<Vec<String>> {
    let mut dropped = Vec::new();

    for slot in inactive_slots(client, prefix).await? {
        match drop_slot(client, &slot).await {
            Ok(()) => {
                info!(slot = %slot, "Dropped inactive replication slot");
                dropped.push(slot);
            }
            Err(e) => warn!(slot = %slot, error = %e, "Failed to drop inactive replication slot"),
        }
    }

    Ok(dropped)
}
