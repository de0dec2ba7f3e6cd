//! Byte-cursor readers/writers over the already-deframed CopyData payload.

use crate::errors::{ReplicationError, ReplicationResult};
use crate::utils::{
    buf_recv_i8, buf_recv_i16, buf_recv_i32, buf_recv_i64, buf_recv_u16, buf_recv_u32,
    buf_recv_u64,
};

/// A cursor over an immutable byte slice with typed, bounds-checked reads.
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    fn need(&self, count: usize, what: &str) -> ReplicationResult<()> {
        if !self.has_bytes(count) {
            return Err(ReplicationError::protocol_at(
                format!("not enough bytes for {what}: need {count}, have {}", self.remaining()),
                self.position,
            ));
        }
        Ok(())
    }

    /// Read and consume the leading message-type tag byte.
    pub fn read_tag(&mut self) -> ReplicationResult<char> {
        self.need(1, "message tag")?;
        let tag = self.buffer[self.position] as char;
        self.position += 1;
        Ok(tag)
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        self.need(1, "u8")?;
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> ReplicationResult<i8> {
        self.need(1, "i8")?;
        let value = buf_recv_i8(&self.buffer[self.position..]);
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> ReplicationResult<u16> {
        self.need(2, "u16")?;
        let value = buf_recv_u16(&self.buffer[self.position..]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> ReplicationResult<i16> {
        self.need(2, "i16")?;
        let value = crate::utils::buf_recv_i16(&self.buffer[self.position..]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> ReplicationResult<u32> {
        self.need(4, "u32")?;
        let value = buf_recv_u32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> ReplicationResult<i32> {
        self.need(4, "i32")?;
        let value = buf_recv_i32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        self.need(8, "u64")?;
        let value = buf_recv_u64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        self.need(8, "i64")?;
        let value = buf_recv_i64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    /// Read a null-terminated string (relation/column/type names).
    pub fn read_cstr(&mut self) -> ReplicationResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(ReplicationError::protocol_at(
                "string not null-terminated",
                start,
            ));
        }
        let s = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1;
        Ok(s)
    }

    /// Read an `i32`-length-prefixed column value. `-1` means SQL NULL and
    /// is surfaced to the caller as `None` rather than an empty `Some(vec![])`.
    pub fn read_length_prefixed(&mut self) -> ReplicationResult<Option<Vec<u8>>> {
        let length = self.read_i32()?;
        if length == -1 {
            return Ok(None);
        }
        if length < 0 {
            return Err(ReplicationError::protocol_at(
                format!("negative tuple column length: {length}"),
                self.position - 4,
            ));
        }
        let length = length as usize;
        self.need(length, "length-prefixed value")?;
        let bytes = self.buffer[self.position..self.position + length].to_vec();
        self.position += length;
        Ok(Some(bytes))
    }

    pub fn peek_u8(&self) -> ReplicationResult<u8> {
        self.need(1, "peek")?;
        Ok(self.buffer[self.position])
    }

    pub fn read_bytes(&mut self, count: usize) -> ReplicationResult<Vec<u8>> {
        self.need(count, "bytes")?;
        let bytes = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }

    /// Remaining bytes as text, used for the textual tuple-column payload.
    pub fn read_remaining_as_string(&mut self, count: usize) -> ReplicationResult<String> {
        let bytes = self.read_bytes(count)?;
        String::from_utf8(bytes).map_err(ReplicationError::from)
    }
}

/// A cursor over a mutable byte slice, used to build the Standby Status
/// Update and Hot Standby Feedback ack frames.
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    fn need(&self, count: usize) -> ReplicationResult<()> {
        if !self.has_space(count) {
            return Err(ReplicationError::protocol_at(
                format!("not enough space: need {count}, have {}", self.remaining()),
                self.position,
            ));
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> ReplicationResult<()> {
        self.need(1)?;
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_char(&mut self, tag: char) -> ReplicationResult<()> {
        self.write_u8(tag as u8)
    }

    pub fn write_u32(&mut self, value: u32) -> ReplicationResult<()> {
        self.need(4)?;
        crate::utils::buf_send_u32(value, &mut self.buffer[self.position..]);
        self.position += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> ReplicationResult<()> {
        self.need(8)?;
        crate::utils::buf_send_u64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> ReplicationResult<()> {
        self.need(8)?;
        crate::utils::buf_send_i64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cstr_and_length_prefixed() {
        let mut data = Vec::new();
        data.extend_from_slice(b"orders\0");
        data.extend_from_slice(&5i32.to_be_bytes());
        data.extend_from_slice(b"hello");
        data.extend_from_slice(&(-1i32).to_be_bytes());

        let mut r = BufferReader::new(&data);
        assert_eq!(r.read_cstr().unwrap(), "orders");
        assert_eq!(r.read_length_prefixed().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(r.read_length_prefixed().unwrap(), None);
    }

    #[test]
    fn rejects_truncated_reads() {
        let data = [0u8; 2];
        let mut r = BufferReader::new(&data);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn writer_roundtrips_status_update_fields() {
        let mut buf = [0u8; 1 + 8 + 8 + 8 + 8 + 1];
        let mut w = BufferWriter::new(&mut buf);
        w.write_char('r').unwrap();
        w.write_u64(100).unwrap();
        w.write_u64(100).unwrap();
        w.write_u64(100).unwrap();
        w.write_i64(0).unwrap();
        w.write_u8(0).unwrap();
        assert_eq!(w.bytes_written(), buf.len());
    }
}
