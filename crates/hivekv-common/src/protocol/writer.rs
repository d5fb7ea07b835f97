//! Request encoding.

use crate::error::{HiveError, Result};
use crate::protocol::{
    proto_header, MSG_HEADER_SIZE, MSG_TIMEOUT_OFFSET, PROTO_HEADER_SIZE, TOTAL_HEADER_SIZE,
};
use crate::value::Value;

/// Cursor that fills a message buffer.
///
/// Every write is bounds-checked: running past the end of the buffer means
/// the caller's size estimate was wrong, which is a fatal client-side error
/// rather than a panic.
pub struct MessageWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> MessageWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> MessageWriter<'a> {
        MessageWriter { buf, offset: 0 }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.offset + bytes.len();
        if end > self.buf.len() {
            return Err(HiveError::Serialize(format!(
                "message exceeds sized buffer: need {} bytes, have {}",
                end,
                self.buf.len()
            )));
        }
        self.buf[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    /// Reserves space for the proto and message headers; field and op writes
    /// follow.
    pub fn begin_message(&mut self) -> Result<()> {
        if TOTAL_HEADER_SIZE > self.buf.len() {
            return Err(HiveError::Serialize(
                "buffer smaller than message header".to_string(),
            ));
        }
        self.buf[..TOTAL_HEADER_SIZE].fill(0);
        self.offset = TOTAL_HEADER_SIZE;
        Ok(())
    }

    /// Fills the 22-byte message header in place.
    #[allow(clippy::too_many_arguments)]
    pub fn message_header(
        &mut self,
        info1: u8,
        info2: u8,
        info3: u8,
        generation: u32,
        expiration: u32,
        field_count: u16,
        op_count: u16,
    ) {
        let h = &mut self.buf[PROTO_HEADER_SIZE..TOTAL_HEADER_SIZE];
        h[0] = MSG_HEADER_SIZE as u8;
        h[1] = info1;
        h[2] = info2;
        h[3] = info3;
        h[4] = 0; // unused
        h[5] = 0; // result code, requests only
        h[6..10].copy_from_slice(&generation.to_be_bytes());
        h[10..14].copy_from_slice(&expiration.to_be_bytes());
        h[14..18].copy_from_slice(&0u32.to_be_bytes()); // transaction ttl, stamped before send
        h[18..20].copy_from_slice(&field_count.to_be_bytes());
        h[20..22].copy_from_slice(&op_count.to_be_bytes());
    }

    pub fn write_field_str(&mut self, field_type: u8, value: &str) -> Result<()> {
        self.write_field_bytes(field_type, value.as_bytes())
    }

    pub fn write_field_bytes(&mut self, field_type: u8, payload: &[u8]) -> Result<()> {
        self.write_u32(payload.len() as u32 + 1)?;
        self.write_u8(field_type)?;
        self.put(payload)
    }

    /// Writes one operation. `Value::Nil` payloads produce a value-less op,
    /// which is how bin reads are expressed.
    pub fn write_op(&mut self, op_type: u8, bin_name: &str, value: &Value) -> Result<()> {
        if bin_name.len() > u8::MAX as usize {
            return Err(HiveError::Serialize(format!(
                "bin name too long: {} bytes",
                bin_name.len()
            )));
        }
        let value_size = value.encoded_size();
        self.write_u32((4 + bin_name.len() + value_size) as u32)?;
        self.write_u8(op_type)?;
        self.write_u8(value.particle_type())?;
        self.write_u8(0)?; // bin version
        self.write_u8(bin_name.len() as u8)?;
        self.put(bin_name.as_bytes())?;
        let mut encoded = Vec::with_capacity(value_size);
        value.write_to(&mut encoded);
        self.put(&encoded)
    }

    /// Stamps the proto header and returns the total message length.
    pub fn finish(&mut self, msg_type: u8) -> usize {
        let body_len = (self.offset - PROTO_HEADER_SIZE) as u64;
        self.buf[..PROTO_HEADER_SIZE].copy_from_slice(&proto_header(msg_type, body_len));
        self.offset
    }
}

/// Writes the per-command server-side deadline into an encoded message.
/// Called immediately before send so retries carry the remaining budget.
pub fn stamp_timeout(buf: &mut [u8], timeout_ms: u32) {
    buf[MSG_TIMEOUT_OFFSET..MSG_TIMEOUT_OFFSET + 4].copy_from_slice(&timeout_ms.to_be_bytes());
}

/// Size of an encoded field carrying `payload_len` bytes.
pub fn field_size(payload_len: usize) -> usize {
    4 + 1 + payload_len
}

/// Size of an encoded operation.
pub fn op_size(bin_name_len: usize, value_size: usize) -> usize {
    4 + 4 + bin_name_len + value_size
}
