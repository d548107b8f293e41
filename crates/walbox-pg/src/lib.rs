mod connect;
pub mod delivery;
mod error;
pub mod heartbeat;
pub mod memory;
pub mod reconcile;
pub mod replication;
pub mod store;
pub mod supervisor;

pub use connect::connect_postgres;
pub use delivery::Delivery;
pub use error::{PgError, PgResult};
pub use memory::MemoryOutboxStore;
pub use reconcile::{ReconcileReport, Reconciler};
pub use replication::{
    format_lsn, parse_lsn, ReplicationSession, StreamSettings, StreamState, WalConsumer,
};
pub use store::{Capabilities, OutboxStore, PostgresOutboxStore, ReconcileWindow, ServerStatus};
pub use supervisor::{ReconnectPolicy, StreamRunner, Supervisor};
