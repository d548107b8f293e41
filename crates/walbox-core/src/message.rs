//! The outbox message shape handed to publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DecodedRow, Value};

/// One outbox row, ready for delivery.
///
/// Field names on the wire follow the storage column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub message: serde_json::Value,
    #[serde(default)]
    pub exchange: String,
    #[serde(rename = "router_key", default)]
    pub routing_key: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(rename = "v_host", default)]
    pub virtual_host: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent: bool,
}

impl OutboxMessage {
    /// Build a message from a decoded outbox row.
    ///
    /// `id` is required. Optional string columns default to an empty string when absent,
    /// null, or unchanged; `message` defaults to JSON null.
    pub fn from_row(row: &DecodedRow) -> Result<Self> {
        let id = match row.get("id") {
            Some(Value::Int(id)) => *id,
            Some(Value::Null) | Some(Value::Unchanged) | None => {
                return Err(Error::MissingColumn("id".into()))
            }
            Some(other) => return Err(invalid("id", "int", other)),
        };

        Ok(Self {
            id,
            message: payload_field(row)?,
            exchange: string_field(row, "exchange")?,
            routing_key: string_field(row, "router_key")?,
            correlation_id: string_field(row, "correlation_id")?,
            reply_to: string_field(row, "reply_to")?,
            virtual_host: string_field(row, "v_host")?,
            created_at: timestamp_field(row, "created_at")?,
            sent: bool_field(row, "sent")?,
        })
    }

    /// Serialized payload bytes as published downstream.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.message)?)
    }
}

fn invalid(column: &str, expected: &str, actual: &Value) -> Error {
    Error::InvalidColumnType {
        column: column.to_string(),
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}

fn string_field(row: &DecodedRow, column: &str) -> Result<String> {
    match row.get(column) {
        Some(Value::Text(s)) => Ok(s.clone()),
        Some(Value::Null) | Some(Value::Unchanged) | None => Ok(String::new()),
        Some(other @ (Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Json(_)
        | Value::Timestamp(_))) => Err(invalid(column, "text", other)),
    }
}

fn payload_field(row: &DecodedRow) -> Result<serde_json::Value> {
    match row.get("message") {
        Some(Value::Json(v)) => Ok(v.clone()),
        // A text column holding JSON is accepted; anything else is carried as a string.
        Some(Value::Text(s)) => {
            Ok(serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())))
        }
        Some(Value::Null) | Some(Value::Unchanged) | None => Ok(serde_json::Value::Null),
        Some(other @ (Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Timestamp(_))) => {
            Err(invalid("message", "json", other))
        }
    }
}

fn timestamp_field(row: &DecodedRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    match row.get(column) {
        Some(Value::Timestamp(ts)) => Ok(Some(*ts)),
        Some(Value::Null) | Some(Value::Unchanged) | None => Ok(None),
        Some(other @ (Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Text(_)
        | Value::Json(_))) => Err(invalid(column, "timestamp", other)),
    }
}

fn bool_field(row: &DecodedRow, column: &str) -> Result<bool> {
    match row.get(column) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Null) | Some(Value::Unchanged) | None => Ok(false),
        Some(other @ (Value::Int(_)
        | Value::Float(_)
        | Value::Text(_)
        | Value::Json(_)
        | Value::Timestamp(_))) => Err(invalid(column, "bool", other)),
    }
}
