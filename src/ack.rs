//! Standby Status Update ack frame: `'r' || flushed+1 || applied+1 || written+1 || clock || 0`.

use crate::buffer::BufferWriter;
use crate::connection::PgConnection;
use crate::errors::ReplicationResult;
use crate::lsn::Lsn;
use crate::utils::system_time_to_postgres_timestamp;
use std::time::SystemTime;
use tracing::debug;

/// Size of the ack frame: tag + 3 LSNs + clock + reply-requested byte.
const ACK_FRAME_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Build and send a Standby Status Update advertising `last_lsn.next()` for
/// flushed/applied/written: a reconnect resumes one past the last byte we
/// actually committed, so the source never replays it.
pub fn send_standby_status_update(conn: &PgConnection, last_lsn: Lsn) -> ReplicationResult<()> {
    let ack_lsn = last_lsn.next().as_u64();
    let clock = system_time_to_postgres_timestamp(SystemTime::now());

    let mut buf = [0u8; ACK_FRAME_LEN];
    {
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_char('r')?;
        writer.write_u64(ack_lsn)?;
        writer.write_u64(ack_lsn)?;
        writer.write_u64(ack_lsn)?;
        writer.write_i64(clock)?;
        writer.write_u8(0)?;
    }

    conn.put_copy_data(&buf)?;
    conn.flush()?;
    debug!(ack_lsn = %last_lsn.next(), "sent standby status update");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_frame_has_expected_length() {
        assert_eq!(ACK_FRAME_LEN, 34);
    }
}
