//! HiveKV Common Types and Transport
//!
//! This crate provides the data model, wire protocol and low-level transport
//! shared by the HiveKV client components.
//!
//! # Overview
//!
//! HiveKV is a distributed, partitioned key-value database. This crate
//! contains everything a command needs before it touches the execution
//! engine:
//!
//! - **Data model**: [`Key`] with its 20-byte digest, [`Record`], tagged
//!   [`Value`] variants and [`Bin`]s
//! - **Protocol layer**: length-framed binary messages, header codecs,
//!   field/operation encoding ([`protocol`])
//! - **Buffers**: the pooled message buffer arena ([`buffer`])
//! - **Transport**: the non-blocking per-node connection ([`transport`])
//! - **Policies**: per-command and per-client configuration ([`policy`])
//! - **Errors**: the client error taxonomy with retryability and
//!   connection-disposition classification ([`error`])
//!
//! # Example
//!
//! ```
//! use hivekv_common::{Bin, Key, Value};
//!
//! let key = Key::new("test", "demo", "user-1").unwrap();
//! assert_eq!(key.digest.len(), 20);
//!
//! let bin = Bin::new("name", "ada");
//! assert_eq!(bin.value, Value::from("ada"));
//! ```

pub mod auth;
pub mod buffer;
pub mod error;
pub mod key;
pub mod policy;
pub mod protocol;
pub mod record;
pub mod transport;
pub mod value;

pub use buffer::{BufferPool, BufferSegment, BUFFER_CUTOFF};
pub use error::{HiveError, Result};
pub use key::{Key, PARTITIONS};
pub use policy::{
    BasePolicy, BatchPolicy, ClientConfig, QueryPolicy, RecordExistsAction, Replica, ScanPolicy,
    WritePolicy,
};
pub use protocol::ResultCode;
pub use record::Record;
pub use transport::AsyncConnection;
pub use value::{Bin, Value};
