//! HiveKV wire protocol definitions.
//!
//! Every message on the wire starts with an 8-byte proto header
//! `(version:8 | type:8 | length:48)`, all fields big-endian. Request and
//! response messages (`type = 3`) carry a further 22-byte message header:
//!
//! ```text
//! header_len(1) | info1(1) | info2(1) | info3(1) | unused(1) | result_code(1)
//! | generation(4) | expiration(4) | transaction_ttl(4)
//! | field_count(2) | op_count(2)
//! ```
//!
//! followed by `field_count` fields and `op_count` operations. Fields are
//! `len(4) | type(1) | payload(len-1)`; operations are
//! `op_size(4) | op_type(1) | particle_type(1) | version(1) | name_len(1)
//! | name | value(op_size - 4 - name_len)`.
//!
//! This module owns the layout constants, the header codecs, and the
//! [`MessageWriter`]/[`MessageReader`] cursors used by the command layer.

pub mod reader;
pub mod writer;

pub use reader::{KeyFields, MessageReader};
pub use writer::{field_size, op_size, stamp_timeout, MessageWriter};

use crate::error::{HiveError, Result};

/// Protocol version stamped into every proto header.
pub const MSG_VERSION: u8 = 2;
/// Proto type for request/response messages.
pub const MSG_TYPE_MESSAGE: u8 = 3;
/// Proto type for admin (authentication) exchanges.
pub const MSG_TYPE_ADMIN: u8 = 2;

/// Size of the leading proto header.
pub const PROTO_HEADER_SIZE: usize = 8;
/// Size of the message header that follows the proto header.
pub const MSG_HEADER_SIZE: usize = 22;
/// Proto header plus message header.
pub const TOTAL_HEADER_SIZE: usize = PROTO_HEADER_SIZE + MSG_HEADER_SIZE;
/// Offset of the server-side deadline (ms) within the 30-byte header.
pub const MSG_TIMEOUT_OFFSET: usize = 22;

/// Record digests are always 20 bytes.
pub const DIGEST_SIZE: usize = 20;

// info1 flags
pub const INFO1_READ: u8 = 0x01;
pub const INFO1_GET_ALL: u8 = 0x02;
pub const INFO1_NOBINDATA: u8 = 0x20;

// info2 flags
pub const INFO2_WRITE: u8 = 0x01;
pub const INFO2_DELETE: u8 = 0x02;
pub const INFO2_GENERATION: u8 = 0x04;
pub const INFO2_GENERATION_GT: u8 = 0x08;
pub const INFO2_GENERATION_DUP: u8 = 0x10;
pub const INFO2_WRITE_UNIQUE: u8 = 0x20;

// info3 flags
/// Final message of a multi-record stream.
pub const INFO3_LAST: u8 = 0x01;

/// Field types carried in the field section of a message.
pub mod field_type {
    pub const NAMESPACE: u8 = 0;
    pub const TABLE: u8 = 1;
    pub const DIGEST_RIPE: u8 = 4;
    pub const DIGEST_RIPE_ARRAY: u8 = 6;
    pub const INDEX_RANGE: u8 = 22;
    pub const SCAN_OPTIONS: u8 = 30;
    pub const UDF_PACKAGE_NAME: u8 = 31;
    pub const UDF_FUNCTION: u8 = 32;
    pub const UDF_ARGLIST: u8 = 33;
}

/// Operation types carried in the op section of a message.
pub mod op_type {
    pub const READ: u8 = 1;
    pub const WRITE: u8 = 2;
    pub const ADD: u8 = 5;
    pub const APPEND: u8 = 9;
    pub const PREPEND: u8 = 10;
    pub const TOUCH: u8 = 11;
}

/// Admin field types used by the authentication exchange.
pub mod admin_field {
    pub const USER: u8 = 0;
    pub const CREDENTIAL: u8 = 3;
}

/// Admin command identifier for authentication.
pub const ADMIN_AUTHENTICATE: u8 = 0;
/// Size of the fixed admin body prefix: `command(1) | result_code(1) | field_count(2)`.
pub const ADMIN_HEADER_SIZE: usize = 4;

/// Server result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    UnknownServerError = 1,
    KeyNotFound = 2,
    GenerationError = 3,
    ParameterError = 4,
    KeyExists = 5,
    BinTypeError = 6,
    ClusterKeyMismatch = 7,
    ServerMemoryError = 8,
    ServerTimeout = 9,
    ServerNotAvailable = 11,
    BinNotFound = 17,
    QueryTerminated = 25,
    ScanTerminated = 26,
    InvalidCredential = 60,
    /// A code this client version does not know about.
    Unknown(u8),
}

impl ResultCode {
    pub fn from_u8(code: u8) -> ResultCode {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::UnknownServerError,
            2 => ResultCode::KeyNotFound,
            3 => ResultCode::GenerationError,
            4 => ResultCode::ParameterError,
            5 => ResultCode::KeyExists,
            6 => ResultCode::BinTypeError,
            7 => ResultCode::ClusterKeyMismatch,
            8 => ResultCode::ServerMemoryError,
            9 => ResultCode::ServerTimeout,
            11 => ResultCode::ServerNotAvailable,
            17 => ResultCode::BinNotFound,
            25 => ResultCode::QueryTerminated,
            26 => ResultCode::ScanTerminated,
            60 => ResultCode::InvalidCredential,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::UnknownServerError => 1,
            ResultCode::KeyNotFound => 2,
            ResultCode::GenerationError => 3,
            ResultCode::ParameterError => 4,
            ResultCode::KeyExists => 5,
            ResultCode::BinTypeError => 6,
            ResultCode::ClusterKeyMismatch => 7,
            ResultCode::ServerMemoryError => 8,
            ResultCode::ServerTimeout => 9,
            ResultCode::ServerNotAvailable => 11,
            ResultCode::BinNotFound => 17,
            ResultCode::QueryTerminated => 25,
            ResultCode::ScanTerminated => 26,
            ResultCode::InvalidCredential => 60,
            ResultCode::Unknown(other) => *other,
        }
    }

    /// Codes where another node or a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResultCode::ServerNotAvailable | ResultCode::ClusterKeyMismatch
        )
    }

    /// Codes that leave the connection's stream framing intact.
    pub fn keep_connection(&self) -> bool {
        matches!(
            self,
            ResultCode::KeyNotFound
                | ResultCode::GenerationError
                | ResultCode::ParameterError
                | ResultCode::KeyExists
                | ResultCode::BinTypeError
                | ResultCode::BinNotFound
        )
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "unknown result code {}", code),
            other => write!(f, "{:?} ({})", other, other.as_u8()),
        }
    }
}

/// Builds the 8-byte proto header for a message of `body_len` bytes.
pub fn proto_header(msg_type: u8, body_len: u64) -> [u8; PROTO_HEADER_SIZE] {
    // (version:8 | type:8 | length:48), big-endian
    let word = ((MSG_VERSION as u64) << 56) | ((msg_type as u64) << 48) | (body_len & 0xFFFF_FFFF_FFFF);
    word.to_be_bytes()
}

/// Decodes an 8-byte proto header into `(version, type, body_len)`.
pub fn parse_proto_header(bytes: &[u8; PROTO_HEADER_SIZE]) -> Result<(u8, u8, u64)> {
    let word = u64::from_be_bytes(*bytes);
    let version = (word >> 56) as u8;
    let msg_type = (word >> 48) as u8;
    let body_len = word & 0xFFFF_FFFF_FFFF;
    if version != MSG_VERSION {
        return Err(HiveError::Parse(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    Ok((version, msg_type, body_len))
}

/// Decoded form of the 22-byte message header.
///
/// The same layout prefixes single-record responses and each record of a
/// multi-record stream.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: ResultCode,
    pub generation: u32,
    pub expiration: u32,
    pub field_count: u16,
    pub op_count: u16,
}

impl MessageHeader {
    /// Parses a message header from `reader`, consuming [`MSG_HEADER_SIZE`] bytes.
    pub fn parse(reader: &mut MessageReader<'_>) -> Result<MessageHeader> {
        let header_len = reader.read_u8()?;
        if header_len as usize != MSG_HEADER_SIZE {
            return Err(HiveError::Parse(format!(
                "unexpected header length {}",
                header_len
            )));
        }
        let info1 = reader.read_u8()?;
        let info2 = reader.read_u8()?;
        let info3 = reader.read_u8()?;
        let _unused = reader.read_u8()?;
        let result_code = ResultCode::from_u8(reader.read_u8()?);
        let generation = reader.read_u32()?;
        let expiration = reader.read_u32()?;
        let _transaction_ttl = reader.read_u32()?;
        let field_count = reader.read_u16()?;
        let op_count = reader.read_u16()?;
        Ok(MessageHeader {
            info1,
            info2,
            info3,
            result_code,
            generation,
            expiration,
            field_count,
            op_count,
        })
    }

    /// Whether this header carries the final-message marker of a stream.
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_header_roundtrip() {
        let header = proto_header(MSG_TYPE_MESSAGE, 1234);
        let (version, msg_type, len) = parse_proto_header(&header).unwrap();
        assert_eq!(version, MSG_VERSION);
        assert_eq!(msg_type, MSG_TYPE_MESSAGE);
        assert_eq!(len, 1234);
    }

    #[test]
    fn test_proto_header_length_is_48_bits() {
        let header = proto_header(MSG_TYPE_MESSAGE, 0xFFFF_FFFF_FFFF);
        let (_, _, len) = parse_proto_header(&header).unwrap();
        assert_eq!(len, 0xFFFF_FFFF_FFFF);
    }

    #[test]
    fn test_proto_header_rejects_wrong_version() {
        let mut header = proto_header(MSG_TYPE_MESSAGE, 8);
        header[0] = 9;
        assert!(parse_proto_header(&header).is_err());
    }

    #[test]
    fn test_result_code_roundtrip() {
        for code in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11, 17, 25, 26, 60, 200] {
            assert_eq!(ResultCode::from_u8(code).as_u8(), code);
        }
    }
}
