//! Outbox storage: sent bookkeeping, the catch-up query and the liveness marker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row};
use tracing::{debug, info, warn};
use walbox_config::{ConnectionParams, WalboxConfig};
use walbox_core::OutboxMessage;

use crate::connect::connect_postgres;
use crate::error::PgResult;
use crate::replication::lsn::parse_lsn;
use crate::replication::publication::{ensure_publication, publication_exists, quote_table_name};
use crate::replication::slot::drop_inactive_slots;

/// Optional schema features detected once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The outbox table has a boolean `sent` column.
    pub has_sent_column: bool,
}

/// Age bounds for rows the reconciler re-drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileWindow {
    /// Rows younger than this are left to the stream.
    pub grace: Duration,
    /// Rows older than this many days are ignored.
    pub max_age_days: u32,
}

impl ReconcileWindow {
    /// Whether a row created at `created_at` falls inside the window at `now`.
    pub fn contains(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        let max_age = chrono::Duration::days(i64::from(self.max_age_days));

        let Some(newest) = now.checked_sub_signed(grace) else {
            return false;
        };
        let after_oldest = now
            .checked_sub_signed(max_age)
            .map_or(true, |oldest| created_at >= oldest);

        created_at <= newest && after_oldest
    }
}

/// Trait for outbox storage operations.
pub trait OutboxStore: Send + Sync {
    /// Mark a row as delivered. Marking an already-sent row is not an error.
    fn mark_sent(&self, id: i64) -> impl Future<Output = PgResult<()>> + Send;

    /// Unsent rows inside the window, ordered by id.
    fn fetch_unsent(
        &self,
        window: ReconcileWindow,
    ) -> impl Future<Output = PgResult<Vec<OutboxMessage>>> + Send;

    /// Upsert the liveness marker row to the current time.
    fn heartbeat(&self) -> impl Future<Output = PgResult<()>> + Send;
}

/// Postgres-backed outbox store.
///
/// Holds one pipelined client shared by every caller and reconnects lazily when the
/// connection has closed.
pub struct PostgresOutboxStore {
    params: ConnectionParams,
    connect_timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
    outbox_table: String,
    heartbeat_table: String,
    schema: String,
    table: String,
    publication: String,
}

impl PostgresOutboxStore {
    /// Connect to the database described by `config`.
    pub async fn connect(config: &WalboxConfig) -> PgResult<Self> {
        let store = Self::new(config)?;
        store.client().await?;
        Ok(store)
    }

    /// Build a store without connecting. The first operation opens the connection.
    pub fn new(config: &WalboxConfig) -> PgResult<Self> {
        let outbox = &config.outbox;
        Ok(Self {
            params: config.connection_params()?,
            connect_timeout: config.replication.connect_timeout(),
            client: Mutex::new(None),
            outbox_table: quote_table_name(&outbox.schema, &outbox.table),
            heartbeat_table: quote_table_name(&outbox.schema, &outbox.heartbeat_table),
            schema: outbox.schema.clone(),
            table: outbox.table.clone(),
            publication: outbox.publication.clone(),
        })
    }

    /// Current client, reconnecting if the previous connection closed.
    pub async fn client(&self) -> PgResult<Arc<Client>> {
        let mut guard = self.client.lock().await;

        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            warn!("Storage connection closed, reconnecting");
        }

        let client = Arc::new(connect_postgres(&self.params, self.connect_timeout).await?);
        debug!(server = %self.params, "Storage connection established");
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Create the outbox publication unless it exists.
    pub async fn ensure_publication(&self) -> PgResult<()> {
        let client = self.client().await?;
        ensure_publication(&client, &self.publication, &self.schema, &self.table).await
    }

    /// Create the heartbeat table unless it exists.
    pub async fn ensure_heartbeat_table(&self) -> PgResult<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id bigint NOT NULL, last_heartbeat timestamptz NOT NULL)",
                self.heartbeat_table
            ))
            .await?;
        Ok(())
    }

    /// Detect optional outbox columns.
    pub async fn probe_capabilities(&self) -> PgResult<Capabilities> {
        let client = self.client().await?;
        let has_sent_column: bool = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM information_schema.columns
                    WHERE table_schema = $1 AND table_name = $2 AND column_name = 'sent'
                )
                "#,
                &[&self.schema, &self.table],
            )
            .await?
            .get(0);

        info!(
            table = %format!("{}.{}", self.schema, self.table),
            has_sent_column,
            "Probed outbox capabilities"
        );
        Ok(Capabilities { has_sent_column })
    }

    /// Drop inactive slots whose name starts with `prefix`.
    pub async fn drop_inactive_slots(&self, prefix: &str) -> PgResult<Vec<String>> {
        let client = self.client().await?;
        drop_inactive_slots(&client, prefix).await
    }

    /// Collect the server facts reported by `walbox check`.
    pub async fn server_status(&self) -> PgResult<ServerStatus> {
        let client = self.client().await?;

        let wal_level: String = client.query_one("SHOW wal_level", &[]).await?.get(0);
        let publication_exists = publication_exists(&client, &self.publication).await?;
        let heartbeat_table_exists: bool = client
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&self.heartbeat_table],
            )
            .await?
            .get(0);
        let lsn: String = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?
            .get(0);

        Ok(ServerStatus {
            wal_level,
            publication_exists,
            heartbeat_table_exists,
            current_wal_lsn: parse_lsn(&lsn)?,
        })
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn mark_sent(&self, id: i64) -> impl Future<Output = PgResult<()>> + Send {
        async move {
            let client = self.client().await?;
            client
                .execute(
                    &format!("UPDATE {} SET sent = true WHERE id = $1", self.outbox_table),
                    &[&id],
                )
                .await?;
            Ok(())
        }
    }

    fn fetch_unsent(
        &self,
        window: ReconcileWindow,
    ) -> impl Future<Output = PgResult<Vec<OutboxMessage>>> + Send {
        async move {
            let client = self.client().await?;
            let sql = format!(
                r#"
                SELECT id::bigint, message::text, exchange::text, v_host::text,
                       router_key::text, correlation_id::text, reply_to::text,
                       created_at::timestamptz, sent
                FROM {}
                WHERE sent = false
                  AND created_at <= current_timestamp - make_interval(secs => $1)
                  AND created_at >= current_timestamp - make_interval(days => $2)
                ORDER BY id
                "#,
                self.outbox_table
            );
            let grace_secs = window.grace.as_secs_f64();
            let max_age_days = i32::try_from(window.max_age_days).unwrap_or(i32::MAX);

            let rows = client.query(&sql, &[&grace_secs, &max_age_days]).await?;
            rows.iter().map(message_from_row).collect()
        }
    }

    fn heartbeat(&self) -> impl Future<Output = PgResult<()>> + Send {
        async move {
            let client = self.client().await?;
            client
                .batch_execute(&format!(
                    r#"
                    WITH updated AS (
                        UPDATE {table} SET last_heartbeat = current_timestamp WHERE id = 1 RETURNING id
                    )
                    INSERT INTO {table} (id, last_heartbeat)
                    SELECT 1, current_timestamp
                    WHERE NOT EXISTS (SELECT 1 FROM updated)
                    "#,
                    table = self.heartbeat_table
                ))
                .await?;
            Ok(())
        }
    }
}

fn message_from_row(row: &Row) -> PgResult<OutboxMessage> {
    let text = |idx: usize| -> PgResult<String> {
        Ok(row.try_get::<_, Option<String>>(idx)?.unwrap_or_default())
    };

    let message = match row.try_get::<_, Option<String>>(1)? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
        None => serde_json::Value::Null,
    };

    Ok(OutboxMessage {
        id: row.try_get(0)?,
        message,
        exchange: text(2)?,
        virtual_host: text(3)?,
        routing_key: text(4)?,
        correlation_id: text(5)?,
        reply_to: text(6)?,
        created_at: row.try_get(7)?,
        sent: row.try_get::<_, Option<bool>>(8)?.unwrap_or(false),
    })
}

/// Facts about the server relevant to running walbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub wal_level: String,
    pub publication_exists: bool,
    pub heartbeat_table_exists: bool,
    pub current_wal_lsn: u64,
}

impl ServerStatus {
    /// Logical decoding requires `wal_level = logical`.
    pub fn logical_replication_enabled(&self) -> bool {
        self.wal_level == "logical"
    }
}
