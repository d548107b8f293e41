//! Push-based CDC over PostgreSQL's logical replication protocol with pgoutput.
//!
//! Each session uses a temporary slot, so nothing is persisted between sessions: a new
//! session re-identifies its start position from the server and rebuilds its relation
//! registry from the Relation messages the server resends.

pub mod client;
pub mod decode;
pub mod lsn;
pub mod pgoutput;
pub mod publication;
pub mod registry;
pub mod slot;
pub mod wire;

pub use client::{ReplicationSession, StreamSettings, StreamState, WalConsumer};
pub use decode::decode_row;
pub use lsn::{format_lsn, parse_lsn, WalPosition};
pub use pgoutput::{PgOutputDecoder, PgOutputMessage};
pub use publication::{ensure_publication, quote_ident, quote_table_name};
pub use registry::{ColumnDef, RelationRegistry, RelationSchema};
pub use slot::{drop_inactive_slots, temporary_slot_name};
pub use wire::{ReplicationConnection, ReplicationFrame, SystemIdentity};
