//! Decoder for the pgoutput logical decoding format, protocol version 1.
//!
//! Only the records the outbox stream acts on are parsed: Begin, Commit, Relation and
//! Insert. Every other record (Update, Delete, Truncate, Type, Origin) comes back as
//! [`PgOutputMessage::Other`] carrying its tag.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{PgError, PgResult};

/// A decoded pgoutput record.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Insert(InsertMessage),
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct BeginMessage {
    pub final_lsn: u64,
    /// Microseconds since 2000-01-01.
    pub commit_time: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub commit_time: i64,
}

/// Schema announcement for one table, sent before its first change in a session.
#[derive(Debug, Clone)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub relation_id: u32,
    pub tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

/// One column of a tuple, by its wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// `n`
    Null,
    /// `u`: an unchanged TOASTed value whose bytes were not sent.
    Unchanged,
    /// `t`
    Text(String),
    /// `b`
    Binary(Vec<u8>),
}

/// Big-endian reader over one record body.
struct RecordReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> RecordReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(body),
        }
    }

    fn remaining(&self) -> usize {
        let consumed = usize::try_from(self.cursor.position()).unwrap_or(usize::MAX);
        self.cursor.get_ref().len().saturating_sub(consumed)
    }

    fn byte(&mut self) -> PgResult<u8> {
        Ok(self.cursor.read_u8()?)
    }

    fn u32(&mut self) -> PgResult<u32> {
        Ok(self.cursor.read_u32::<BigEndian>()?)
    }

    fn i32(&mut self) -> PgResult<i32> {
        Ok(self.cursor.read_i32::<BigEndian>()?)
    }

    fn u64(&mut self) -> PgResult<u64> {
        Ok(self.cursor.read_u64::<BigEndian>()?)
    }

    fn i64(&mut self) -> PgResult<i64> {
        Ok(self.cursor.read_i64::<BigEndian>()?)
    }

    /// Int16 column count; negative counts are rejected.
    fn count(&mut self) -> PgResult<usize> {
        let n = self.cursor.read_i16::<BigEndian>()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("negative column count: {}", n)))
    }

    /// Null-terminated string.
    fn cstr(&mut self) -> PgResult<String> {
        let mut raw = Vec::new();
        loop {
            match self.byte()? {
                0 => break,
                b => raw.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Int32 length followed by that many bytes.
    fn sized(&mut self) -> PgResult<Vec<u8>> {
        let len = self.i32()?;
        let len = usize::try_from(len)
            .map_err(|_| PgError::Protocol(format!("negative value length: {}", len)))?;
        if len > self.remaining() {
            return Err(PgError::Protocol(format!(
                "value length {} exceeds the {} bytes left in the record",
                len,
                self.remaining()
            )));
        }
        let mut raw = vec![0u8; len];
        self.cursor.read_exact(&mut raw)?;
        Ok(raw)
    }
}

impl BeginMessage {
    fn read(r: &mut RecordReader<'_>) -> PgResult<Self> {
        Ok(Self {
            final_lsn: r.u64()?,
            commit_time: r.i64()?,
            xid: r.u32()?,
        })
    }
}

impl CommitMessage {
    fn read(r: &mut RecordReader<'_>) -> PgResult<Self> {
        let _flags = r.byte()?;
        Ok(Self {
            commit_lsn: r.u64()?,
            end_lsn: r.u64()?,
            commit_time: r.i64()?,
        })
    }
}

impl RelationMessage {
    fn read(r: &mut RecordReader<'_>) -> PgResult<Self> {
        let relation_id = r.u32()?;
        let namespace = r.cstr()?;
        let name = r.cstr()?;
        let replica_identity = r.byte()?;

        let count = r.count()?;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let is_key = r.byte()? & 1 == 1;
            columns.push(ColumnInfo {
                name: r.cstr()?,
                type_oid: r.u32()?,
                type_modifier: r.i32()?,
                is_key,
            });
        }

        Ok(Self {
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }
}

impl InsertMessage {
    fn read(r: &mut RecordReader<'_>) -> PgResult<Self> {
        let relation_id = r.u32()?;
        match r.byte()? {
            b'N' => Ok(Self {
                relation_id,
                tuple: TupleData::read(r)?,
            }),
            other => Err(PgError::Protocol(format!(
                "insert for relation {} has tuple marker '{}', expected 'N'",
                relation_id, other as char
            ))),
        }
    }
}

impl TupleData {
    fn read(r: &mut RecordReader<'_>) -> PgResult<Self> {
        let count = r.count()?;
        let mut columns = Vec::with_capacity(count);

        for idx in 0..count {
            let value = match r.byte()? {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::Unchanged,
                b't' => {
                    let text = String::from_utf8(r.sized()?).map_err(|e| {
                        PgError::Protocol(format!("column {} is not valid UTF-8: {}", idx, e))
                    })?;
                    ColumnValue::Text(text)
                }
                b'b' => ColumnValue::Binary(r.sized()?),
                other => {
                    return Err(PgError::Protocol(format!(
                        "column {} has unknown value tag 0x{:02X}",
                        idx, other
                    )))
                }
            };
            columns.push(value);
        }

        Ok(Self { columns })
    }
}

/// Stateless pgoutput decoder.
#[derive(Debug, Default)]
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one XLogData payload.
    pub fn decode(&self, data: &[u8]) -> PgResult<PgOutputMessage> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| PgError::Protocol("empty pgoutput record".into()))?;
        let mut r = RecordReader::new(body);

        Ok(match tag {
            b'B' => PgOutputMessage::Begin(BeginMessage::read(&mut r)?),
            b'C' => PgOutputMessage::Commit(CommitMessage::read(&mut r)?),
            b'R' => PgOutputMessage::Relation(RelationMessage::read(&mut r)?),
            b'I' => PgOutputMessage::Insert(InsertMessage::read(&mut r)?),
            other => PgOutputMessage::Other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn decode(data: &[u8]) -> PgResult<PgOutputMessage> {
        PgOutputDecoder::new().decode(data)
    }

    #[test]
    fn test_begin_and_commit() {
        let mut begin = vec![b'B'];
        begin.put_u64(0x0100_0028);
        begin.put_i64(770_000_000);
        begin.put_u32(731);

        let PgOutputMessage::Begin(b) = decode(&begin).unwrap() else {
            panic!("expected Begin");
        };
        assert_eq!(
            (b.final_lsn, b.commit_time, b.xid),
            (0x0100_0028, 770_000_000, 731)
        );

        let mut commit = vec![b'C', 0];
        commit.put_u64(0x0100_0028);
        commit.put_u64(0x0100_0058);
        commit.put_i64(770_000_001);

        let PgOutputMessage::Commit(c) = decode(&commit).unwrap() else {
            panic!("expected Commit");
        };
        assert_eq!(c.commit_lsn, 0x0100_0028);
        assert_eq!(c.end_lsn, 0x0100_0058);
        assert_eq!(c.commit_time, 770_000_001);
    }

    #[test]
    fn test_relation_columns_in_order() {
        let mut data = vec![b'R'];
        data.put_u32(16390);
        data.extend_from_slice(b"billing\0outbox\0");
        data.put_u8(b'f');
        data.put_i16(3);
        for (flags, name, oid) in [(1u8, "id", 20u32), (0, "message", 3802), (0, "sent", 16)] {
            data.put_u8(flags);
            data.extend_from_slice(name.as_bytes());
            data.put_u8(0);
            data.put_u32(oid);
            data.put_i32(-1);
        }

        let PgOutputMessage::Relation(rel) = decode(&data).unwrap() else {
            panic!("expected Relation");
        };
        assert_eq!(rel.relation_id, 16390);
        assert_eq!(
            (rel.namespace.as_str(), rel.name.as_str()),
            ("billing", "outbox")
        );
        assert_eq!(rel.replica_identity, b'f');
        let names: Vec<_> = rel.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "message", "sent"]);
        assert!(rel.columns[0].is_key);
        assert!(!rel.columns[1].is_key);
        assert_eq!(rel.columns[1].type_oid, 3802);
        assert_eq!(rel.columns[2].type_modifier, -1);
    }

    #[test]
    fn test_insert_tuple_tags() {
        let mut data = vec![b'I'];
        data.put_u32(16390);
        data.put_u8(b'N');
        data.put_i16(4);
        data.put_u8(b't');
        data.put_i32(2);
        data.extend_from_slice(b"42");
        data.put_u8(b'n');
        data.put_u8(b'u');
        data.put_u8(b'b');
        data.put_i32(2);
        data.extend_from_slice(&[0xCA, 0xFE]);

        let PgOutputMessage::Insert(insert) = decode(&data).unwrap() else {
            panic!("expected Insert");
        };
        assert_eq!(insert.relation_id, 16390);
        assert_eq!(
            insert.tuple.columns,
            vec![
                ColumnValue::Text("42".into()),
                ColumnValue::Null,
                ColumnValue::Unchanged,
                ColumnValue::Binary(vec![0xCA, 0xFE]),
            ]
        );
    }

    #[test]
    fn test_malformed_records() {
        // value length runs past the end
        let mut truncated = vec![b'I'];
        truncated.put_u32(1);
        truncated.put_u8(b'N');
        truncated.put_i16(1);
        truncated.put_u8(b't');
        truncated.put_i32(10);
        truncated.extend_from_slice(b"abc");
        assert!(matches!(decode(&truncated), Err(PgError::Protocol(_))));

        // a huge declared length is refused before anything is allocated
        let mut oversized = vec![b'I'];
        oversized.put_u32(1);
        oversized.put_u8(b'N');
        oversized.put_i16(1);
        oversized.put_u8(b'b');
        oversized.put_i32(i32::MAX);
        assert!(matches!(decode(&oversized), Err(PgError::Protocol(_))));

        let mut bad_marker = vec![b'I'];
        bad_marker.put_u32(1);
        bad_marker.put_u8(b'K');
        assert!(matches!(decode(&bad_marker), Err(PgError::Protocol(_))));

        let mut bad_tag = vec![b'I'];
        bad_tag.put_u32(1);
        bad_tag.put_u8(b'N');
        bad_tag.put_i16(1);
        bad_tag.put_u8(b'x');
        assert!(matches!(decode(&bad_tag), Err(PgError::Protocol(_))));

        let mut negative = vec![b'R'];
        negative.put_u32(1);
        negative.extend_from_slice(b"public\0t\0");
        negative.put_u8(b'd');
        negative.put_i16(-1);
        assert!(matches!(decode(&negative), Err(PgError::Protocol(_))));

        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_unhandled_records_are_tagged() {
        for tag in [b'U', b'D', b'T', b'Y', b'O'] {
            assert!(matches!(
                decode(&[tag, 0, 0]).unwrap(),
                PgOutputMessage::Other(t) if t == tag
            ));
        }
    }
}
