//! Shared parsing for streamed multi-record responses.
//!
//! Batch, scan and query children all receive the same shape on the wire: a
//! sequence of proto frames, each packing one or more records prefixed by the
//! standard 22-byte message header, closed by a header carrying the
//! final-message marker. Records are handed to a [`RecordConsumer`] one at a
//! time; the stop flag is consulted at record boundaries so a closed record
//! set aborts promptly without tearing the connection mid-frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hivekv_common::error::{HiveError, Result};
use hivekv_common::key::Key;
use hivekv_common::protocol::{MessageHeader, MessageReader, ResultCode};
use hivekv_common::record::Record;

use crate::command::ParseStatus;
use crate::recordset::RecordSink;

/// Receives records as a stream child parses them.
///
/// Returning `Ok(false)` stops the stream: the child terminates with the
/// stream's termination error and the executor treats it as an abort rather
/// than a server failure.
pub(crate) trait RecordConsumer: Send {
    fn consume(&mut self, key: Key, record: Option<Record>) -> Result<bool>;
}

/// Which streaming command a parser serves; decides the benign result codes
/// and the termination error.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Batch,
    Scan,
    Query,
}

impl StreamKind {
    fn terminated(&self) -> HiveError {
        match self {
            StreamKind::Scan => HiveError::ScanTerminated,
            StreamKind::Query => HiveError::QueryTerminated,
            StreamKind::Batch => HiveError::ScanTerminated,
        }
    }
}

/// Incremental parser for one child's record stream.
pub(crate) struct StreamParser {
    kind: StreamKind,
    /// Namespace of the request, used when a record omits the field.
    namespace: String,
    stop: Arc<AtomicBool>,
    started: bool,
}

impl StreamParser {
    pub fn new(kind: StreamKind, namespace: impl Into<String>, stop: Arc<AtomicBool>) -> StreamParser {
        StreamParser {
            kind,
            namespace: namespace.into(),
            stop,
            started: false,
        }
    }

    /// Whether any record of the stream has been consumed. Once true the
    /// command can no longer be retried.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Parses every record in `frame`, emitting each to `consumer`.
    pub fn parse<C: RecordConsumer>(
        &mut self,
        frame: &[u8],
        consumer: &mut C,
    ) -> Result<ParseStatus<()>> {
        let mut reader = MessageReader::new(frame);
        while reader.remaining() > 0 {
            let header = MessageHeader::parse(&mut reader)?;
            if header.is_last() {
                return Ok(ParseStatus::Done(()));
            }
            if self.stop.load(Ordering::Acquire) {
                return Err(self.kind.terminated());
            }

            let found = match header.result_code {
                ResultCode::Ok => true,
                // A batch slot for an absent key streams through as a
                // not-found record rather than failing the child.
                ResultCode::KeyNotFound if self.kind == StreamKind::Batch => false,
                code => return Err(HiveError::ServerError(code)),
            };

            let fields = reader.read_key_fields(header.field_count)?;
            let digest = fields
                .digest
                .ok_or_else(|| HiveError::Parse("record without digest".to_string()))?;
            let key = Key::from_digest(
                fields
                    .namespace
                    .unwrap_or_else(|| self.namespace.clone()),
                fields.set_name.unwrap_or_default(),
                digest,
            );

            let record = if found {
                let bins = reader.read_bins(header.op_count)?;
                Some(Record::new(bins, header.generation, header.expiration))
            } else {
                None
            };

            self.started = true;
            if !consumer.consume(key, record)? {
                return Err(self.kind.terminated());
            }
        }
        Ok(ParseStatus::Continue)
    }
}

/// Consumer bridging a stream child to a [`RecordSet`](crate::recordset::RecordSet).
///
/// Rows collect here while a frame is being parsed and drain into the
/// bounded queue between frames, where the driver can await capacity.
pub(crate) struct SinkConsumer {
    pending: Vec<(Key, Record)>,
    sink: RecordSink,
    kind: StreamKind,
}

impl SinkConsumer {
    pub fn new(sink: RecordSink, kind: StreamKind) -> SinkConsumer {
        SinkConsumer {
            pending: Vec::new(),
            sink,
            kind,
        }
    }

    /// Pushes collected rows through the bounded queue.
    pub async fn flush(&mut self) -> Result<()> {
        let kind = self.kind;
        for (key, record) in self.pending.drain(..) {
            self.sink
                .push(key, record)
                .await
                .map_err(|_| kind.terminated())?;
        }
        Ok(())
    }
}

impl RecordConsumer for SinkConsumer {
    fn consume(&mut self, key: Key, record: Option<Record>) -> Result<bool> {
        if let Some(record) = record {
            self.pending.push((key, record));
        }
        Ok(true)
    }
}
