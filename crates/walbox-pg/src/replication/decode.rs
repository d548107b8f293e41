//! Type-directed decoding of pgoutput tuples into [`DecodedRow`]s.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use walbox_core::{DecodedRow, Value};

use super::pgoutput::{ColumnValue, TupleData};
use super::registry::{ColumnDef, RelationSchema};
use crate::error::{PgError, PgResult};

// Built-in type OIDs (pg_type.oid).
const BOOL_OID: u32 = 16;
const INT8_OID: u32 = 20;
const INT2_OID: u32 = 21;
const INT4_OID: u32 = 23;
const TEXT_OID: u32 = 25;
const JSON_OID: u32 = 114;
const FLOAT4_OID: u32 = 700;
const FLOAT8_OID: u32 = 701;
const BPCHAR_OID: u32 = 1042;
const VARCHAR_OID: u32 = 1043;
const DATE_OID: u32 = 1082;
const TIMESTAMP_OID: u32 = 1114;
const TIMESTAMPTZ_OID: u32 = 1184;
const JSONB_OID: u32 = 3802;

/// Decode a tuple against the schema its relation declared.
///
/// Columns are matched by position and the tuple must carry exactly the declared
/// columns. A column that fails to decode aborts the whole row.
pub fn decode_row(schema: &RelationSchema, tuple: &TupleData) -> PgResult<DecodedRow> {
    if tuple.columns.len() != schema.columns.len() {
        return Err(PgError::Protocol(format!(
            "tuple has {} columns but relation {} declares {}",
            tuple.columns.len(),
            schema.qualified_name(),
            schema.columns.len()
        )));
    }

    schema
        .columns
        .iter()
        .zip(tuple.columns.iter())
        .map(|(column, raw)| -> PgResult<(String, Value)> {
            Ok((column.name.clone(), decode_column(column, raw)?))
        })
        .collect()
}

fn decode_column(column: &ColumnDef, raw: &ColumnValue) -> PgResult<Value> {
    match raw {
        ColumnValue::Null => Ok(Value::Null),
        ColumnValue::Unchanged => Ok(Value::Unchanged),
        ColumnValue::Text(text) => {
            decode_text(column.type_oid, text).map_err(|message| PgError::Decode {
                column: column.name.clone(),
                message,
            })
        }
        ColumnValue::Binary(_) => Err(PgError::Decode {
            column: column.name.clone(),
            message: "binary column values are not supported".to_string(),
        }),
    }
}

/// Decode a text-format value based on its PostgreSQL type OID.
fn decode_text(type_oid: u32, s: &str) -> Result<Value, String> {
    match type_oid {
        INT2_OID | INT4_OID | INT8_OID => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| format!("invalid integer '{}': {}", s, e)),
        FLOAT4_OID | FLOAT8_OID => s
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("invalid float '{}': {}", s, e)),
        BOOL_OID => match s {
            "t" => Ok(Value::Bool(true)),
            "f" => Ok(Value::Bool(false)),
            other => Err(format!("invalid bool '{}'", other)),
        },
        JSON_OID | JSONB_OID => serde_json::from_str(s)
            .map(Value::Json)
            .map_err(|e| format!("invalid json: {}", e)),
        DATE_OID | TIMESTAMP_OID | TIMESTAMPTZ_OID => parse_timestamp(s).map(Value::Timestamp),
        TEXT_OID | VARCHAR_OID | BPCHAR_OID => Ok(Value::Text(s.to_string())),
        _ => Ok(Value::Text(s.to_string())),
    }
}

/// Parse Postgres' text rendering of date, timestamp and timestamptz values.
///
/// Values without a zone are taken as UTC; a bare date is midnight UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Some(naive) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(format!("invalid timestamp '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(columns: &[(&str, u32)]) -> RelationSchema {
        RelationSchema {
            namespace: "public".to_string(),
            name: "outbox".to_string(),
            columns: columns
                .iter()
                .map(|(name, oid)| ColumnDef {
                    name: name.to_string(),
                    type_oid: *oid,
                })
                .collect(),
        }
    }

    fn text(s: &str) -> ColumnValue {
        ColumnValue::Text(s.to_string())
    }

    fn decode_one(type_oid: u32, raw: ColumnValue) -> PgResult<Value> {
        let row = decode_row(
            &schema(&[("c", type_oid)]),
            &TupleData { columns: vec![raw] },
        )?;
        Ok(row.get("c").cloned().unwrap_or(Value::Null))
    }

    #[test]
    fn test_decode_row_declared_columns_in_order() {
        let schema = schema(&[("id", INT8_OID), ("exchange", TEXT_OID), ("sent", BOOL_OID)]);
        let tuple = TupleData {
            columns: vec![text("1"), text("orders"), text("f")],
        };

        let row = decode_row(&schema, &tuple).unwrap();
        assert_eq!(
            row.column_names().collect::<Vec<_>>(),
            vec!["id", "exchange", "sent"]
        );
        assert_eq!(row.get("id"), Some(&Value::Int(1)));
        assert_eq!(row.get("exchange"), Some(&Value::Text("orders".into())));
        assert_eq!(row.get("sent"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_decode_integer_family() {
        for oid in [INT2_OID, INT4_OID, INT8_OID] {
            assert_eq!(decode_one(oid, text("-42")).unwrap(), Value::Int(-42));
        }
        assert_eq!(
            decode_one(INT8_OID, text("9223372036854775807")).unwrap(),
            Value::Int(i64::MAX)
        );
        assert!(matches!(
            decode_one(INT4_OID, text("4x")),
            Err(PgError::Decode { ref column, .. }) if column == "c"
        ));
    }

    #[test]
    fn test_decode_float_family() {
        assert_eq!(decode_one(FLOAT8_OID, text("1.5")).unwrap(), Value::Float(1.5));
        assert_eq!(decode_one(FLOAT4_OID, text("-0.25")).unwrap(), Value::Float(-0.25));
        assert!(decode_one(FLOAT8_OID, text("one")).is_err());
    }

    #[test]
    fn test_decode_bool_is_strict() {
        assert_eq!(decode_one(BOOL_OID, text("t")).unwrap(), Value::Bool(true));
        assert_eq!(decode_one(BOOL_OID, text("f")).unwrap(), Value::Bool(false));
        assert!(decode_one(BOOL_OID, text("true")).is_err());
        assert!(decode_one(BOOL_OID, text("")).is_err());
    }

    #[test]
    fn test_decode_json_family() {
        assert_eq!(
            decode_one(JSONB_OID, text(r#"{"a":[1,2]}"#)).unwrap(),
            Value::Json(serde_json::json!({"a": [1, 2]}))
        );
        assert_eq!(
            decode_one(JSON_OID, text("[true]")).unwrap(),
            Value::Json(serde_json::json!([true]))
        );
        assert_eq!(
            decode_one(JSONB_OID, text("3")).unwrap(),
            Value::Json(serde_json::json!(3))
        );
        assert!(decode_one(JSONB_OID, text("{broken")).is_err());
    }

    #[test]
    fn test_decode_text_family_and_unknown_types() {
        for oid in [TEXT_OID, VARCHAR_OID, BPCHAR_OID] {
            assert_eq!(
                decode_one(oid, text("hello")).unwrap(),
                Value::Text("hello".into())
            );
        }
        // uuid and numeric pass through untouched
        assert_eq!(
            decode_one(2950, text("0d3c1e8e-7f0a-4c55-9f43-0f4a0c7f3a11")).unwrap(),
            Value::Text("0d3c1e8e-7f0a-4c55-9f43-0f4a0c7f3a11".into())
        );
        assert_eq!(decode_one(1700, text("12.50")).unwrap(), Value::Text("12.50".into()));
    }

    #[test]
    fn test_decode_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        assert_eq!(
            decode_one(TIMESTAMPTZ_OID, text("2024-05-01 12:30:00+00")).unwrap(),
            Value::Timestamp(expected)
        );
        assert_eq!(
            decode_one(TIMESTAMPTZ_OID, text("2024-05-01 14:30:00+02:00")).unwrap(),
            Value::Timestamp(expected)
        );
        assert_eq!(
            decode_one(TIMESTAMP_OID, text("2024-05-01 12:30:00")).unwrap(),
            Value::Timestamp(expected)
        );
        assert_eq!(
            decode_one(DATE_OID, text("2024-05-01")).unwrap(),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );

        let with_micros = decode_one(TIMESTAMPTZ_OID, text("2024-05-01 12:30:00.123456+00")).unwrap();
        match with_micros {
            Value::Timestamp(ts) => assert_eq!(ts.timestamp_subsec_micros(), 123456),
            other => panic!("expected timestamp, got {:?}", other),
        }

        assert!(decode_one(TIMESTAMPTZ_OID, text("yesterday")).is_err());
    }

    #[test]
    fn test_null_and_unchanged_markers() {
        let schema = schema(&[("a", TEXT_OID), ("b", JSONB_OID)]);
        let tuple = TupleData {
            columns: vec![ColumnValue::Null, ColumnValue::Unchanged],
        };

        let row = decode_row(&schema, &tuple).unwrap();
        assert_eq!(row.get("a"), Some(&Value::Null));
        assert_eq!(row.get("b"), Some(&Value::Unchanged));
    }

    #[test]
    fn test_binary_column_is_decode_error() {
        let result = decode_one(INT8_OID, ColumnValue::Binary(vec![0, 1]));
        assert!(matches!(result, Err(PgError::Decode { .. })));
    }

    #[test]
    fn test_tuple_column_count_must_match_schema() {
        let wide = TupleData {
            columns: vec![text("1"), text("2")],
        };
        assert!(matches!(
            decode_row(&schema(&[("id", INT8_OID)]), &wide),
            Err(PgError::Protocol(_))
        ));

        // a short tuple must not yield a row missing its routing columns
        let short = TupleData {
            columns: vec![text("1")],
        };
        assert!(matches!(
            decode_row(&schema(&[("id", INT8_OID), ("exchange", TEXT_OID)]), &short),
            Err(PgError::Protocol(_))
        ));
    }
}
