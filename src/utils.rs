//! Small helpers shared across the protocol and connection layers:
//! network-byte-order integer codecs and the Postgres epoch conversion.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch (1970-01-01) to the Postgres epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub type Oid = u32;
pub type Xid = u32;

/// Convert a `SystemTime` to a Postgres `TimestampTz` (microseconds since
/// 2000-01-01 UTC), used for keepalive replies and Standby Status Update frames.
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> i64 {
    let since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

pub fn buf_recv_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[..2].try_into().unwrap())
}

pub fn buf_recv_i16(buf: &[u8]) -> i16 {
    i16::from_be_bytes(buf[..2].try_into().unwrap())
}

pub fn buf_recv_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().unwrap())
}

pub fn buf_recv_i32(buf: &[u8]) -> i32 {
    i32::from_be_bytes(buf[..4].try_into().unwrap())
}

pub fn buf_recv_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

pub fn buf_recv_i64(buf: &[u8]) -> i64 {
    i64::from_be_bytes(buf[..8].try_into().unwrap())
}

pub fn buf_recv_i8(buf: &[u8]) -> i8 {
    buf[0] as i8
}

pub fn buf_send_u32(val: u32, buf: &mut [u8]) {
    buf[..4].copy_from_slice(&val.to_be_bytes());
}

pub fn buf_send_u64(val: u64, buf: &mut [u8]) {
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

pub fn buf_send_i64(val: i64, buf: &mut [u8]) {
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_epoch_shift() {
        // 2000-01-01T00:00:00Z is Unix 946684800.
        let t = UNIX_EPOCH + std::time::Duration::from_secs(946_684_800);
        assert_eq!(system_time_to_postgres_timestamp(t), 0);
    }

    #[test]
    fn be_roundtrip() {
        let mut buf = [0u8; 8];
        buf_send_u64(0x0102030405060708, &mut buf);
        assert_eq!(buf_recv_u64(&buf), 0x0102030405060708);
    }
}
