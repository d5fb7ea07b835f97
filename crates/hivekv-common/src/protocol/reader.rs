//! Response decoding.

use std::collections::HashMap;

use crate::error::{HiveError, Result};
use crate::protocol::{field_type, MessageHeader, DIGEST_SIZE};
use crate::record::Record;
use crate::value::Value;

/// Cursor over a received message body.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> MessageReader<'a> {
        MessageReader { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(HiveError::Parse(format!(
                "truncated message: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_str(&mut self, n: usize) -> Result<&'a str> {
        std::str::from_utf8(self.take(n)?)
            .map_err(|e| HiveError::Parse(format!("invalid utf-8: {}", e)))
    }

    /// Skips `count` fields without interpreting them.
    pub fn skip_fields(&mut self, count: u16) -> Result<()> {
        for _ in 0..count {
            let len = self.read_u32()? as usize;
            self.take(len)?;
        }
        Ok(())
    }

    /// Reads `count` key fields, collecting namespace, set name and digest.
    /// Unknown field types are skipped.
    pub fn read_key_fields(&mut self, count: u16) -> Result<KeyFields> {
        let mut fields = KeyFields::default();
        for _ in 0..count {
            let len = self.read_u32()? as usize;
            if len == 0 {
                return Err(HiveError::Parse("zero-length field".to_string()));
            }
            let ftype = self.read_u8()?;
            let payload = self.take(len - 1)?;
            match ftype {
                field_type::NAMESPACE => {
                    fields.namespace = Some(utf8(payload)?.to_string());
                }
                field_type::TABLE => {
                    fields.set_name = Some(utf8(payload)?.to_string());
                }
                field_type::DIGEST_RIPE => {
                    let digest: [u8; DIGEST_SIZE] = payload.try_into().map_err(|_| {
                        HiveError::Parse(format!("digest of {} bytes", payload.len()))
                    })?;
                    fields.digest = Some(digest);
                }
                _ => {}
            }
        }
        Ok(fields)
    }

    /// Reads `count` operations into a bin map.
    pub fn read_bins(&mut self, count: u16) -> Result<HashMap<String, Value>> {
        let mut bins = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let op_size = self.read_u32()? as usize;
            let _op_type = self.read_u8()?;
            let particle = self.read_u8()?;
            let _version = self.read_u8()?;
            let name_len = self.read_u8()? as usize;
            if op_size < 4 + name_len {
                return Err(HiveError::Parse(format!(
                    "operation size {} shorter than its bin name",
                    op_size
                )));
            }
            let name = self.read_str(name_len)?.to_string();
            let value_len = op_size - 4 - name_len;
            let value = Value::read_from(particle, self.take(value_len)?)?;
            bins.insert(name, value);
        }
        Ok(bins)
    }

    /// Parses the record body (fields then bins) that follows `header`.
    pub fn read_record(&mut self, header: &MessageHeader) -> Result<Record> {
        self.skip_fields(header.field_count)?;
        let bins = self.read_bins(header.op_count)?;
        Ok(Record::new(bins, header.generation, header.expiration))
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| HiveError::Parse(format!("invalid utf-8: {}", e)))
}

/// Key identity carried in the field section of a record message.
#[derive(Debug, Default)]
pub struct KeyFields {
    pub namespace: Option<String>,
    pub set_name: Option<String>,
    pub digest: Option<[u8; DIGEST_SIZE]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::writer::MessageWriter;
    use crate::protocol::{op_type, PROTO_HEADER_SIZE, TOTAL_HEADER_SIZE};

    #[test]
    fn test_read_bins() {
        let mut buf = vec![0u8; 256];
        let mut w = MessageWriter::new(&mut buf);
        w.begin_message().unwrap();
        w.write_op(op_type::WRITE, "a", &Value::Int(7)).unwrap();
        w.write_op(op_type::WRITE, "b", &Value::from("x")).unwrap();
        let end = w.offset();

        let mut r = MessageReader::new(&buf[TOTAL_HEADER_SIZE..end]);
        let bins = r.read_bins(2).unwrap();
        assert_eq!(bins["a"], Value::Int(7));
        assert_eq!(bins["b"], Value::from("x"));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_read_key_fields() {
        let digest = [9u8; DIGEST_SIZE];
        let mut buf = vec![0u8; 256];
        let mut w = MessageWriter::new(&mut buf);
        w.begin_message().unwrap();
        w.write_field_str(field_type::NAMESPACE, "ns").unwrap();
        w.write_field_str(field_type::TABLE, "set").unwrap();
        w.write_field_bytes(field_type::DIGEST_RIPE, &digest).unwrap();
        let end = w.offset();

        let mut r = MessageReader::new(&buf[TOTAL_HEADER_SIZE..end]);
        let fields = r.read_key_fields(3).unwrap();
        assert_eq!(fields.namespace.as_deref(), Some("ns"));
        assert_eq!(fields.set_name.as_deref(), Some("set"));
        assert_eq!(fields.digest, Some(digest));
    }

    #[test]
    fn test_truncated_body_is_parse_error() {
        let mut buf = vec![0u8; 64];
        let mut w = MessageWriter::new(&mut buf);
        w.begin_message().unwrap();
        w.write_op(op_type::WRITE, "a", &Value::Int(7)).unwrap();
        let end = w.offset();

        let mut r = MessageReader::new(&buf[TOTAL_HEADER_SIZE..end - 2]);
        assert!(matches!(r.read_bins(1), Err(HiveError::Parse(_))));
    }

    #[test]
    fn test_reader_tracks_offsets() {
        let data = [0u8, 1, 0, 2, 0, 0, 0, 3];
        let mut r = MessageReader::new(&data);
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 2);
        assert_eq!(r.read_u32().unwrap(), 3);
        assert_eq!(r.offset(), PROTO_HEADER_SIZE);
        assert_eq!(r.remaining(), 0);
    }
}
