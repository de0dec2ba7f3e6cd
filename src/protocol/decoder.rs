//! Logical decoder: turns an `XLogData` payload into a typed
//! [`LogicalMessage`], protocol version 1 only.

use tracing::warn;

use crate::buffer::BufferReader;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::relation::ColumnInfo;
use crate::utils::Oid;

/// One tuple slot as sent on the wire: `'n'` null, `'u'` unchanged TOAST, or
/// `'t'` text. The distinction between `Null` and `UnchangedToast` matters
/// downstream during enrichment and must not be collapsed.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleSlot {
    Null,
    UnchangedToast,
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TupleData {
    pub columns: Vec<TupleSlot>,
}

/// Which marker preceded an Update's or Delete's tuple: `'K'` (key columns
/// only, default replica identity) or `'O'` (full old row, REPLICA IDENTITY
/// FULL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    Key,
    Old,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: u64,
        commit_ts: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts: i64,
    },
    Relation {
        oid: Oid,
        namespace: String,
        name: String,
        replica_identity: u8,
        columns: Vec<ColumnInfo>,
    },
    Insert {
        relation_oid: Oid,
        new: TupleData,
    },
    Update {
        relation_oid: Oid,
        old_kind: Option<OldTupleKind>,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_oid: Oid,
        key_kind: OldTupleKind,
        key_or_old: TupleData,
    },
    Truncate {
        relation_oids: Vec<Oid>,
        cascade: bool,
        restart_identity: bool,
    },
    Type {
        oid: Oid,
        namespace: String,
        name: String,
    },
    Origin {
        origin_lsn: u64,
        name: String,
    },
    /// An unrecognized top-level message tag. Logged and skipped upstream;
    /// carries no LSN or transaction data so it cannot affect ack advancement.
    Unknown(char),
}

/// Decode one logical-replication message from an `XLogData` payload.
pub fn decode(payload: &[u8]) -> ReplicationResult<LogicalMessage> {
    let mut reader = BufferReader::new(payload);
    let tag = reader.read_tag()?;
    match tag {
        'B' => decode_begin(&mut reader),
        'C' => decode_commit(&mut reader),
        'R' => decode_relation(&mut reader),
        'I' => decode_insert(&mut reader),
        'U' => decode_update(&mut reader),
        'D' => decode_delete(&mut reader),
        'T' => decode_truncate(&mut reader),
        'Y' => decode_type(&mut reader),
        'O' => decode_origin(&mut reader),
        other => {
            warn!(tag = %other, "unknown logical message tag, skipping");
            Ok(LogicalMessage::Unknown(other))
        }
    }
}

fn decode_begin(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    Ok(LogicalMessage::Begin {
        final_lsn: reader.read_u64()?,
        commit_ts: reader.read_i64()?,
        xid: reader.read_u32()?,
    })
}

fn decode_commit(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    Ok(LogicalMessage::Commit {
        flags: reader.read_u8()?,
        commit_lsn: reader.read_u64()?,
        end_lsn: reader.read_u64()?,
        commit_ts: reader.read_i64()?,
    })
}

fn decode_relation(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    let oid = reader.read_u32()?;
    let namespace = reader.read_cstr()?;
    let name = reader.read_cstr()?;
    let replica_identity = reader.read_u8()?;
    let ncols = reader.read_u16()?;

    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let flags = reader.read_i8()?;
        let col_name = reader.read_cstr()?;
        let type_oid = reader.read_u32()?;
        let type_modifier = reader.read_i32()?;
        columns.push(ColumnInfo {
            name: col_name,
            type_oid,
            type_modifier,
            decoder_flags_pk: flags == 1,
            is_pk: false,
        });
    }

    Ok(LogicalMessage::Relation {
        oid,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_tuple_data(reader: &mut BufferReader<'_>) -> ReplicationResult<TupleData> {
    let ncols = reader.read_u16()?;
    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let slot_tag = reader.read_tag()?;
        let slot = match slot_tag {
            'n' => TupleSlot::Null,
            'u' => TupleSlot::UnchangedToast,
            't' => {
                let len = reader.read_u32()? as usize;
                TupleSlot::Text(reader.read_remaining_as_string(len)?)
            }
            other => {
                return Err(ReplicationError::protocol_at(
                    format!("unknown tuple column tag '{other}'"),
                    reader.position(),
                ));
            }
        };
        columns.push(slot);
    }
    Ok(TupleData { columns })
}

fn decode_insert(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    let relation_oid = reader.read_u32()?;
    let marker = reader.read_tag()?;
    if marker != 'N' {
        return Err(ReplicationError::protocol_at(
            format!("expected 'N' marker in Insert, got '{marker}'"),
            reader.position(),
        ));
    }
    let new = decode_tuple_data(reader)?;
    Ok(LogicalMessage::Insert { relation_oid, new })
}

fn decode_update(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    let relation_oid = reader.read_u32()?;
    let marker = reader.read_tag()?;

    let (old_kind, old) = match marker {
        'K' => (Some(OldTupleKind::Key), Some(decode_tuple_data(reader)?)),
        'O' => (Some(OldTupleKind::Old), Some(decode_tuple_data(reader)?)),
        'N' => (None, None),
        other => {
            return Err(ReplicationError::protocol_at(
                format!("unexpected Update marker '{other}'"),
                reader.position(),
            ));
        }
    };

    if old.is_some() {
        let new_marker = reader.read_tag()?;
        if new_marker != 'N' {
            return Err(ReplicationError::protocol_at(
                format!("expected 'N' marker after old tuple in Update, got '{new_marker}'"),
                reader.position(),
            ));
        }
    }

    let new = decode_tuple_data(reader)?;
    Ok(LogicalMessage::Update {
        relation_oid,
        old_kind,
        old,
        new,
    })
}

fn decode_delete(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    let relation_oid = reader.read_u32()?;
    let marker = reader.read_tag()?;
    let key_kind = match marker {
        'K' => OldTupleKind::Key,
        'O' => OldTupleKind::Old,
        other => {
            return Err(ReplicationError::protocol_at(
                format!("unexpected Delete marker '{other}'"),
                reader.position(),
            ));
        }
    };
    let key_or_old = decode_tuple_data(reader)?;
    Ok(LogicalMessage::Delete {
        relation_oid,
        key_kind,
        key_or_old,
    })
}

fn decode_truncate(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    let nrelations = reader.read_u32()?;
    let flags = reader.read_u8()?;
    let mut relation_oids = Vec::with_capacity(nrelations as usize);
    for _ in 0..nrelations {
        relation_oids.push(reader.read_u32()?);
    }
    Ok(LogicalMessage::Truncate {
        relation_oids,
        cascade: flags & 0x1 != 0,
        restart_identity: flags & 0x2 != 0,
    })
}

fn decode_type(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    Ok(LogicalMessage::Type {
        oid: reader.read_u32()?,
        namespace: reader.read_cstr()?,
        name: reader.read_cstr()?,
    })
}

fn decode_origin(reader: &mut BufferReader<'_>) -> ReplicationResult<LogicalMessage> {
    Ok(LogicalMessage::Origin {
        origin_lsn: reader.read_u64()?,
        name: reader.read_cstr()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_bytes(lsn: u64, ts: i64, xid: u32) -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&lsn.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&xid.to_be_bytes());
        buf
    }

    #[test]
    fn decodes_begin() {
        let bytes = begin_bytes(0x1A0, 123, 42);
        match decode(&bytes).unwrap() {
            LogicalMessage::Begin {
                final_lsn,
                commit_ts,
                xid,
            } => {
                assert_eq!(final_lsn, 0x1A0);
                assert_eq!(commit_ts, 123);
                assert_eq!(xid, 42);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_insert_with_text_tuple() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(b'1');
        buf.push(b'n');

        match decode(&buf).unwrap() {
            LogicalMessage::Insert { relation_oid, new } => {
                assert_eq!(relation_oid, 7);
                assert_eq!(
                    new.columns,
                    vec![TupleSlot::Text("1".to_string()), TupleSlot::Null]
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_tuple_slot_tag() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(b'?');
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn unknown_top_level_tag_is_skipped_not_errored() {
        let buf = vec![b'?', 1, 2, 3];
        match decode(&buf).unwrap() {
            LogicalMessage::Unknown(tag) => assert_eq!(tag, '?'),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_delete_with_key_tuple() {
        let mut buf = vec![b'D'];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(b'K');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(b'1');

        match decode(&buf).unwrap() {
            LogicalMessage::Delete {
                relation_oid,
                key_kind,
                key_or_old,
            } => {
                assert_eq!(relation_oid, 7);
                assert_eq!(key_kind, OldTupleKind::Key);
                assert_eq!(key_or_old.columns, vec![TupleSlot::Text("1".to_string())]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
