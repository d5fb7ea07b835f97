//! Bounded queue delivering scan and query records to a single consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use hivekv_common::error::{HiveError, Result};
use hivekv_common::key::Key;
use hivekv_common::record::Record;

enum Item {
    Row(Key, Record),
    End(Option<HiveError>),
}

/// Consumer half of a streaming command.
///
/// Parser tasks push `(key, record)` pairs into a bounded queue; the consumer
/// drains them with [`RecordSet::next_record`]. A sentinel end marker is
/// enqueued on completion or abort; receiving it ends iteration and surfaces
/// any stored error. Closing the set raises a flag the producers check at
/// record boundaries.
pub struct RecordSet {
    rx: mpsc::Receiver<Item>,
    stop: Arc<AtomicBool>,
    finished: bool,
}

impl RecordSet {
    pub(crate) fn channel(capacity: usize) -> (RecordSink, RecordSet) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        (
            RecordSink {
                tx,
                stop: Arc::clone(&stop),
            },
            RecordSet {
                rx,
                stop,
                finished: false,
            },
        )
    }

    /// The next record, `Some(Err(..))` once if the stream failed, then
    /// `None` forever.
    pub async fn next_record(&mut self) -> Option<Result<(Key, Record)>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Item::Row(key, record)) => Some(Ok((key, record))),
            Some(Item::End(Some(error))) => {
                self.finished = true;
                Some(Err(error))
            }
            Some(Item::End(None)) | None => {
                self.finished = true;
                None
            }
        }
    }

    /// Aborts the producers. They observe the flag at their next record
    /// boundary and terminate the stream.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
        self.finished = true;
    }
}

impl Drop for RecordSet {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Producer half shared by the stream children.
#[derive(Clone)]
pub(crate) struct RecordSink {
    tx: mpsc::Sender<Item>,
    stop: Arc<AtomicBool>,
}

impl RecordSink {
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Queues one row, waiting for capacity. Fails with the stream stopped
    /// when the consumer has gone away.
    pub(crate) async fn push(&self, key: Key, record: Record) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(HiveError::QueryTerminated);
        }
        self.tx
            .send(Item::Row(key, record))
            .await
            .map_err(|_| HiveError::QueryTerminated)
    }

    /// Enqueues the end sentinel. The consumer may already be gone; that is
    /// not an error.
    pub(crate) async fn finish(self, error: Option<HiveError>) {
        let _ = self.tx.send(Item::End(error)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(n: i64) -> (Key, Record) {
        let key = Key::new("ns", "set", n).unwrap();
        let record = Record::new(HashMap::new(), 1, 0);
        (key, record)
    }

    #[tokio::test]
    async fn test_rows_then_end() {
        let (sink, mut set) = RecordSet::channel(8);
        let (k1, r1) = row(1);
        sink.push(k1.clone(), r1).await.unwrap();
        sink.finish(None).await;

        let (key, _) = set.next_record().await.unwrap().unwrap();
        assert_eq!(key.digest, k1.digest);
        assert!(set.next_record().await.is_none());
        // End is sticky.
        assert!(set.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_stored_error_surfaces_once() {
        let (sink, mut set) = RecordSet::channel(8);
        sink.finish(Some(HiveError::Parse("bad".to_string()))).await;

        match set.next_record().await {
            Some(Err(HiveError::Parse(_))) => {}
            other => panic!("expected stored error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(set.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_close_stops_producers() {
        let (sink, mut set) = RecordSet::channel(1);
        set.close();
        let (key, record) = row(1);
        assert!(matches!(
            sink.push(key, record).await,
            Err(HiveError::QueryTerminated)
        ));
    }

    #[tokio::test]
    async fn test_drop_raises_stop_flag() {
        let (sink, set) = RecordSet::channel(1);
        let stop = sink.stop_flag();
        drop(set);
        assert!(stop.load(Ordering::Acquire));
    }
}
