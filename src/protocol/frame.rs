//! Byte framer: tags each CopyBoth payload `XLogData`, `PrimaryKeepalive`,
//! or `Unknown` and strips the fixed-size frame header.

use crate::buffer::BufferReader;
use crate::errors::ReplicationResult;
use crate::lsn::Lsn;
use tracing::warn;

/// `'w'` XLogData: the logical-message payload plus the frame's own LSN
/// bookkeeping. `start_lsn`/`end_lsn` describe the WAL range this frame
/// covers, not the logical message's own LSN fields (those live inside the
/// decoded `Begin`/`Commit` messages).
#[derive(Debug, Clone, PartialEq)]
pub struct XLogDataFrame {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub server_clock: i64,
    pub payload: Vec<u8>,
}

/// `'k'` PrimaryKeepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveFrame {
    pub wal_end: Lsn,
    pub server_clock: i64,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    XLogData(XLogDataFrame),
    Keepalive(KeepaliveFrame),
    /// An unrecognized leading tag byte. Logged and skipped upstream;
    /// carries no LSN so it cannot affect ack advancement.
    Unknown(u8),
}

/// Tag-dispatch one CopyData row already deframed by `PQgetCopyData`.
pub fn parse_frame(data: &[u8]) -> ReplicationResult<Frame> {
    if data.is_empty() {
        return Ok(Frame::Unknown(0));
    }

    let tag = data[0];
    match tag {
        b'w' => {
            let mut reader = BufferReader::new(data);
            reader.read_tag()?;
            let start_lsn = Lsn::from(reader.read_u64()?);
            let end_lsn = Lsn::from(reader.read_u64()?);
            let server_clock = reader.read_i64()?;
            let payload = reader.read_bytes(reader.remaining())?;
            Ok(Frame::XLogData(XLogDataFrame {
                start_lsn,
                end_lsn,
                server_clock,
                payload,
            }))
        }
        b'k' => {
            let mut reader = BufferReader::new(data);
            reader.read_tag()?;
            let wal_end = Lsn::from(reader.read_u64()?);
            let server_clock = reader.read_i64()?;
            let reply_requested = reader.read_u8()? == 1;
            Ok(Frame::Keepalive(KeepaliveFrame {
                wal_end,
                server_clock,
                reply_requested,
            }))
        }
        other => {
            warn!(tag = other, "unknown CopyData frame tag, skipping");
            Ok(Frame::Unknown(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xlogdata_frame() {
        let mut data = vec![b'w'];
        data.extend_from_slice(&0x1A0u64.to_be_bytes());
        data.extend_from_slice(&0x1A0u64.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.push(b'B');

        match parse_frame(&data).unwrap() {
            Frame::XLogData(frame) => {
                assert_eq!(frame.start_lsn, Lsn::from(0x1A0));
                assert_eq!(frame.payload, vec![b'B']);
            }
            other => panic!("expected XLogData, got {other:?}"),
        }
    }

    #[test]
    fn parses_keepalive_frame() {
        let mut data = vec![b'k'];
        data.extend_from_slice(&0x2A0u64.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.push(1);

        match parse_frame(&data).unwrap() {
            Frame::Keepalive(frame) => {
                assert!(frame.reply_requested);
                assert_eq!(frame.wal_end, Lsn::from(0x2A0));
            }
            other => panic!("expected Keepalive, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_skipped_not_errored() {
        let data = vec![b'?', 1, 2, 3];
        assert!(matches!(parse_frame(&data).unwrap(), Frame::Unknown(b'?')));
    }
}
