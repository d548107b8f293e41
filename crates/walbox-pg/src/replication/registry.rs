//! Registry of relation schemas announced on the stream.
//!
//! PostgreSQL sends a Relation message before the first change on each table in a
//! replication session. Inserts only carry the relation id, so the registry is needed to
//! name and type their columns. A registry lives exactly as long as one session.

use std::collections::HashMap;

use super::pgoutput::RelationMessage;
use crate::error::{PgError, PgResult};

/// One column of a relation, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_oid: u32,
}

/// Column layout of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl RelationSchema {
    /// Fully qualified table name, for logging.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl From<&RelationMessage> for RelationSchema {
    fn from(msg: &RelationMessage) -> Self {
        Self {
            namespace: msg.namespace.clone(),
            name: msg.name.clone(),
            columns: msg
                .columns
                .iter()
                .map(|c| ColumnDef {
                    name: c.name.clone(),
                    type_oid: c.type_oid,
                })
                .collect(),
        }
    }
}

/// Map of relation id to schema.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: HashMap<u32, RelationSchema>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous entry for the same id.
    pub fn add(&mut self, relation_id: u32, schema: RelationSchema) {
        self.relations.insert(relation_id, schema);
    }

    pub fn lookup(&self, relation_id: u32) -> PgResult<&RelationSchema> {
        self.relations
            .get(&relation_id)
            .ok_or(PgError::RelationNotFound(relation_id))
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
