//! Streaming scan and query behavior against a mock node.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::MockNode;
use hivekv_client::listener::RecordSequenceListener;
use hivekv_client::{Filter, HiveClient, Statement};
use hivekv_common::error::HiveError;
use hivekv_common::policy::{ClientConfig, QueryPolicy, ScanPolicy, WritePolicy};
use hivekv_common::record::Record;
use hivekv_common::value::{Bin, Value};
use hivekv_common::Key;

async fn seeded_client(node: &MockNode, count: usize) -> HiveClient {
    let client = HiveClient::connect(ClientConfig::default(), &[node.addr.as_str()])
        .await
        .unwrap();
    for i in 0..count {
        let key = Key::new("ns", "set", format!("scan-{}", i)).unwrap();
        client
            .put(
                &WritePolicy::default(),
                &key,
                &[Bin::new("n", (i + 1) as i64)],
            )
            .await
            .unwrap();
    }
    client
}

#[tokio::test]
async fn test_scan_yields_every_record_once() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 1000).await;

    let mut set = client.scan_all(&ScanPolicy::default(), "ns", "set");
    let mut digests = HashSet::new();
    let mut total = 0usize;
    while let Some(row) = set.next_record().await {
        let (key, _record) = row.unwrap();
        assert!(digests.insert(key.digest), "duplicate key streamed");
        total += 1;
    }
    assert_eq!(total, 1000);
    client.close().await;
}

#[tokio::test]
async fn test_scan_of_empty_set_ends_immediately() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 0).await;

    let mut set = client.scan_all(&ScanPolicy::default(), "ns", "empty");
    assert!(set.next_record().await.is_none());
    client.close().await;
}

#[tokio::test]
async fn test_scan_ignores_other_sets() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 10).await;
    let other = Key::new("ns", "other", "x").unwrap();
    client
        .put(&WritePolicy::default(), &other, &[Bin::new("n", 0i64)])
        .await
        .unwrap();

    let mut set = client.scan_all(&ScanPolicy::default(), "ns", "set");
    let mut total = 0;
    while let Some(row) = set.next_record().await {
        row.unwrap();
        total += 1;
    }
    assert_eq!(total, 10);
    client.close().await;
}

#[tokio::test]
async fn test_scan_close_stops_stream() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 500).await;

    let mut set = client.scan_all(
        &ScanPolicy {
            record_queue_size: 4,
            ..ScanPolicy::default()
        },
        "ns",
        "set",
    );
    for _ in 0..10 {
        set.next_record().await.unwrap().unwrap();
    }
    set.close();
    assert!(set.next_record().await.is_none());
    client.close().await;
}

#[tokio::test]
async fn test_range_query_returns_exact_matches() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 50).await;

    let statement = Statement::new("ns", "set").with_filter(Filter::range("n", 14, 18));
    let mut set = client.query(&QueryPolicy::default(), statement);

    let mut values = Vec::new();
    while let Some(row) = set.next_record().await {
        let (_, record) = row.unwrap();
        match record.bin("n") {
            Some(Value::Int(v)) => values.push(*v),
            other => panic!("unexpected bin {:?}", other),
        }
    }
    values.sort_unstable();
    assert_eq!(values, vec![14, 15, 16, 17, 18]);
    client.close().await;
}

#[tokio::test]
async fn test_equal_query_single_match() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 50).await;

    let statement = Statement::new("ns", "set").with_filter(Filter::equal("n", 7i64));
    let mut set = client.query(&QueryPolicy::default(), statement);

    let mut total = 0;
    while let Some(row) = set.next_record().await {
        let (_, record) = row.unwrap();
        assert_eq!(record.bin("n"), Some(&Value::Int(7)));
        total += 1;
    }
    assert_eq!(total, 1);
    client.close().await;
}

struct CountingListener {
    records: Arc<AtomicUsize>,
    completions: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl RecordSequenceListener for CountingListener {
    fn on_record(&mut self, _key: Key, _record: Record) -> Result<(), HiveError> {
        self.records.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_success(self: Box<Self>) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(self: Box<Self>, _error: HiveError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_scan_sequence_listener_exactly_one_terminal_call() {
    let node = MockNode::start().await;
    let client = seeded_client(&node, 100).await;

    let records = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    client.scan_all_with_listener(
        &ScanPolicy::default(),
        "ns",
        "set",
        Box::new(CountingListener {
            records: Arc::clone(&records),
            completions: Arc::clone(&completions),
            failures: Arc::clone(&failures),
        }),
    );

    // Wait for the stream to drain.
    for _ in 0..100 {
        if completions.load(Ordering::SeqCst) + failures.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(records.load(Ordering::SeqCst), 100);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    client.close().await;
}
