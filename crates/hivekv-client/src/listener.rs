//! Completion callbacks.
//!
//! Each listener receives exactly one terminal call, `on_success` or
//! `on_failure`, from whichever task completes the command; implementations
//! must not assume a particular thread. The terminal methods consume the
//! listener (`self: Box<Self>`), so a second terminal call is unrepresentable.
//!
//! Sequence listeners additionally receive one `on_record` call per streamed
//! record, in server order per node and unspecified order across nodes. An
//! `on_record` error aborts the stream and is later delivered through
//! `on_failure`: this is the one shape where a listener observes both a
//! record-path error of its own making and a terminal failure call.

use hivekv_common::error::HiveError;
use hivekv_common::key::Key;
use hivekv_common::record::Record;
use hivekv_common::value::Value;

/// Completion of a single-record read.
pub trait RecordListener: Send + 'static {
    fn on_success(self: Box<Self>, key: Key, record: Option<Record>);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of a write, append, prepend, add or touch.
pub trait WriteListener: Send + 'static {
    fn on_success(self: Box<Self>, key: Key);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of a delete; reports whether the record existed.
pub trait DeleteListener: Send + 'static {
    fn on_success(self: Box<Self>, key: Key, existed: bool);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of an existence check.
pub trait ExistsListener: Send + 'static {
    fn on_success(self: Box<Self>, key: Key, exists: bool);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of a batch read; results arrive in submitted order with `None`
/// in the slot of each absent key.
pub trait BatchListListener: Send + 'static {
    fn on_success(self: Box<Self>, records: Vec<Option<Record>>);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of a batch existence check, in submitted order.
pub trait ExistsArrayListener: Send + 'static {
    fn on_success(self: Box<Self>, exists: Vec<bool>);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Streamed records from a scan or query.
pub trait RecordSequenceListener: Send + 'static {
    /// Called once per record. Returning an error aborts the stream; the
    /// error then surfaces through `on_failure`.
    fn on_record(&mut self, key: Key, record: Record) -> Result<(), HiveError>;
    fn on_success(self: Box<Self>);
    fn on_failure(self: Box<Self>, error: HiveError);
}

/// Completion of a server-side UDF execution.
pub trait ExecuteListener: Send + 'static {
    fn on_success(self: Box<Self>, key: Key, result: Option<Value>);
    fn on_failure(self: Box<Self>, error: HiveError);
}
