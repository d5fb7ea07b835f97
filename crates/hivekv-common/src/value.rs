//! Bin values and their on-wire particle encoding.

use crate::error::{HiveError, Result};

/// Particle type tags used on the wire.
pub mod particle_type {
    pub const NULL: u8 = 0;
    pub const INTEGER: u8 = 1;
    pub const UINT: u8 = 2;
    pub const STRING: u8 = 3;
    pub const BLOB: u8 = 4;
    pub const LIST: u8 = 5;
    pub const MAP: u8 = 6;
    pub const OPAQUE: u8 = 7;
}

/// A single bin value.
///
/// Integers travel as 8-byte big-endian words, strings as UTF-8, byte arrays
/// raw. Lists and maps are encoded recursively as a 4-byte element count
/// followed by `type(1) | len(4) | payload` per element (maps alternate key
/// and value). `Opaque` carries bytes serialized by an external library that
/// the client stores without interpreting.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Uint(u64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Opaque(Vec<u8>),
}

impl Value {
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => particle_type::NULL,
            Value::Int(_) => particle_type::INTEGER,
            Value::Uint(_) => particle_type::UINT,
            Value::Str(_) => particle_type::STRING,
            Value::Bytes(_) => particle_type::BLOB,
            Value::List(_) => particle_type::LIST,
            Value::Map(_) => particle_type::MAP,
            Value::Opaque(_) => particle_type::OPAQUE,
        }
    }

    /// Exact number of bytes [`Value::write_to`] will produce.
    pub fn encoded_size(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Int(_) | Value::Uint(_) => 8,
            Value::Str(s) => s.len(),
            Value::Bytes(b) | Value::Opaque(b) => b.len(),
            Value::List(items) => {
                4 + items.iter().map(|v| 5 + v.encoded_size()).sum::<usize>()
            }
            Value::Map(entries) => {
                4 + entries
                    .iter()
                    .map(|(k, v)| 10 + k.encoded_size() + v.encoded_size())
                    .sum::<usize>()
            }
        }
    }

    /// Appends the particle payload to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Nil => {}
            Value::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Uint(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) | Value::Opaque(b) => out.extend_from_slice(b),
            Value::List(items) => {
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    write_element(item, out);
                }
            }
            Value::Map(entries) => {
                out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for (key, value) in entries {
                    write_element(key, out);
                    write_element(value, out);
                }
            }
        }
    }

    /// Decodes a particle payload of the given type.
    pub fn read_from(ptype: u8, bytes: &[u8]) -> Result<Value> {
        match ptype {
            particle_type::NULL => Ok(Value::Nil),
            particle_type::INTEGER => Ok(Value::Int(i64::from_be_bytes(int_bytes(bytes)?))),
            particle_type::UINT => Ok(Value::Uint(u64::from_be_bytes(int_bytes(bytes)?))),
            particle_type::STRING => String::from_utf8(bytes.to_vec())
                .map(Value::Str)
                .map_err(|e| HiveError::Parse(format!("invalid utf-8 in string particle: {}", e))),
            particle_type::BLOB => Ok(Value::Bytes(bytes.to_vec())),
            particle_type::OPAQUE => Ok(Value::Opaque(bytes.to_vec())),
            particle_type::LIST => {
                let (count, mut rest) = split_count(bytes)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let (item, tail) = read_element(rest)?;
                    items.push(item);
                    rest = tail;
                }
                Ok(Value::List(items))
            }
            particle_type::MAP => {
                let (count, mut rest) = split_count(bytes)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let (key, tail) = read_element(rest)?;
                    let (value, tail) = read_element(tail)?;
                    entries.push((key, value));
                    rest = tail;
                }
                Ok(Value::Map(entries))
            }
            other => Err(HiveError::Parse(format!("unknown particle type {}", other))),
        }
    }
}

fn write_element(value: &Value, out: &mut Vec<u8>) {
    out.push(value.particle_type());
    out.extend_from_slice(&(value.encoded_size() as u32).to_be_bytes());
    value.write_to(out);
}

fn read_element(bytes: &[u8]) -> Result<(Value, &[u8])> {
    if bytes.len() < 5 {
        return Err(HiveError::Parse("truncated collection element".to_string()));
    }
    let ptype = bytes[0];
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if bytes.len() < 5 + len {
        return Err(HiveError::Parse("truncated collection element".to_string()));
    }
    let value = Value::read_from(ptype, &bytes[5..5 + len])?;
    Ok((value, &bytes[5 + len..]))
}

fn split_count(bytes: &[u8]) -> Result<(usize, &[u8])> {
    if bytes.len() < 4 {
        return Err(HiveError::Parse("truncated collection header".to_string()));
    }
    let count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    Ok((count, &bytes[4..]))
}

fn int_bytes(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| HiveError::Parse(format!("integer particle of {} bytes", bytes.len())))
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Opaque(b) => write!(f, "opaque[{}]", b.len()),
            Value::List(items) => write!(f, "list[{}]", items.len()),
            Value::Map(entries) => write!(f, "map[{}]", entries.len()),
        }
    }
}

/// A named bin paired with its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Bin {
        Bin {
            name: name.into(),
            value: value.into(),
        }
    }
}
