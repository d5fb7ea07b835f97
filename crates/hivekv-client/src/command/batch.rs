//! Batch reads: one child command per `(node, namespace)` group of keys.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use hivekv_common::error::Result;
use hivekv_common::key::Key;
use hivekv_common::policy::{BasePolicy, BatchPolicy, Replica};
use hivekv_common::protocol::{
    field_size, field_type, op_size, op_type, MessageWriter, DIGEST_SIZE, INFO1_GET_ALL,
    INFO1_NOBINDATA, INFO1_READ, MSG_TYPE_MESSAGE, TOTAL_HEADER_SIZE,
};
use hivekv_common::record::Record;
use hivekv_common::value::Value;

use crate::cluster::{Cluster, Node};
use crate::command::multi::{RecordConsumer, StreamKind, StreamParser};
use crate::command::{execute, Command, ParseStatus};
use crate::executor::MultiExecutor;

/// What a batch child asks the server to return.
#[derive(Clone)]
enum BatchMode {
    /// Full records, optionally restricted to named bins.
    Records(Option<Vec<String>>),
    /// Metadata only; used by the exists array.
    ExistsOnly,
}

/// Writes each streamed record into its submitted slot, keyed by digest.
/// Duplicate keys in the request all receive the record.
struct SlotConsumer {
    results: Arc<Mutex<Vec<Option<Record>>>>,
    slots: Arc<HashMap<[u8; DIGEST_SIZE], Vec<usize>>>,
}

impl RecordConsumer for SlotConsumer {
    fn consume(&mut self, key: Key, record: Option<Record>) -> Result<bool> {
        if let Some(indices) = self.slots.get(&key.digest) {
            let mut results = self.results.lock();
            for &index in indices {
                results[index] = record.clone();
            }
        }
        Ok(true)
    }
}

/// One batch request against one node for one namespace.
struct BatchChild {
    policy: BasePolicy,
    node: Arc<Node>,
    namespace: String,
    digests: Vec<[u8; DIGEST_SIZE]>,
    mode: BatchMode,
    parser: StreamParser,
    consumer: SlotConsumer,
}

impl Command for BatchChild {
    type Output = ();

    fn policy(&self) -> BasePolicy {
        self.policy.clone()
    }

    fn node(&mut self, _cluster: &Cluster, _iteration: u32) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.node))
    }

    fn estimate_size(&self) -> Result<usize> {
        let mut size = TOTAL_HEADER_SIZE
            + field_size(self.namespace.len())
            + field_size(self.digests.len() * DIGEST_SIZE);
        if let BatchMode::Records(Some(names)) = &self.mode {
            for name in names {
                size += op_size(name.len(), 0);
            }
        }
        Ok(size)
    }

    fn write(&mut self, w: &mut MessageWriter<'_>) -> Result<usize> {
        let mut digest_array = Vec::with_capacity(self.digests.len() * DIGEST_SIZE);
        for digest in &self.digests {
            digest_array.extend_from_slice(digest);
        }

        let (info1, bin_names) = match &self.mode {
            BatchMode::Records(Some(names)) if !names.is_empty() => {
                (INFO1_READ, names.as_slice())
            }
            BatchMode::Records(_) => (INFO1_READ | INFO1_GET_ALL, &[][..]),
            BatchMode::ExistsOnly => (INFO1_READ | INFO1_NOBINDATA, &[][..]),
        };

        w.begin_message()?;
        w.write_field_str(field_type::NAMESPACE, &self.namespace)?;
        w.write_field_bytes(field_type::DIGEST_RIPE_ARRAY, &digest_array)?;
        for name in bin_names {
            w.write_op(op_type::READ, name, &Value::Nil)?;
        }
        w.message_header(info1, 0, 0, 0, 0, 2, bin_names.len() as u16);
        Ok(w.finish(MSG_TYPE_MESSAGE))
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Result<ParseStatus<Self::Output>> {
        self.parser.parse(frame, &mut self.consumer)
    }

    fn retryable(&self) -> bool {
        // A child mid-stream cannot be replayed; slots may already be filled.
        !self.parser.started()
    }
}

/// Fans a batch read over the cluster and gathers results in submitted order.
/// Absent keys occupy their slot as `None`.
async fn batch_read(
    cluster: &Arc<Cluster>,
    policy: &BatchPolicy,
    keys: &[Key],
    mode: BatchMode,
) -> Result<Vec<Option<Record>>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let results = Arc::new(Mutex::new(vec![None; keys.len()]));
    let mut slots: HashMap<[u8; DIGEST_SIZE], Vec<usize>> = HashMap::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        slots.entry(key.digest).or_default().push(index);
    }
    let slots = Arc::new(slots);

    // One child per (node, namespace) pair.
    let mut groups: HashMap<(String, String), (Arc<Node>, Vec<[u8; DIGEST_SIZE]>)> = HashMap::new();
    for key in keys {
        let node = cluster.get_node(key.partition_id(), Replica::Master, 0)?;
        let group = groups
            .entry((node.name().to_string(), key.namespace.clone()))
            .or_insert_with(|| (node, Vec::new()));
        group.1.push(key.digest);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let executor = MultiExecutor::new(Arc::clone(&stop));

    let children: Vec<_> = groups
        .into_iter()
        .map(|((_, namespace), (node, digests))| {
            let child = BatchChild {
                policy: policy.base.clone(),
                node,
                namespace: namespace.clone(),
                digests,
                mode: mode.clone(),
                parser: StreamParser::new(StreamKind::Batch, namespace, Arc::clone(&stop)),
                consumer: SlotConsumer {
                    results: Arc::clone(&results),
                    slots: Arc::clone(&slots),
                },
            };
            let cluster = Arc::clone(cluster);
            async move { execute(&cluster, child).await }
        })
        .collect();

    executor.run(policy.max_concurrent_nodes, children).await?;

    let mut results = results.lock();
    Ok(std::mem::take(&mut *results))
}

/// Batch get: full records (or the named bins) in submitted order.
pub(crate) async fn batch_get(
    cluster: &Arc<Cluster>,
    policy: &BatchPolicy,
    keys: &[Key],
    bin_names: Option<Vec<String>>,
) -> Result<Vec<Option<Record>>> {
    batch_read(cluster, policy, keys, BatchMode::Records(bin_names)).await
}

/// Batch exists: one boolean per submitted key, in order.
pub(crate) async fn batch_exists(
    cluster: &Arc<Cluster>,
    policy: &BatchPolicy,
    keys: &[Key],
) -> Result<Vec<bool>> {
    let records = batch_read(cluster, policy, keys, BatchMode::ExistsOnly).await?;
    Ok(records.iter().map(Option::is_some).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_consumer_fills_duplicates() {
        let keys = [
            Key::new("ns", "set", "a").unwrap(),
            Key::new("ns", "set", "b").unwrap(),
            Key::new("ns", "set", "a").unwrap(),
        ];
        let results = Arc::new(Mutex::new(vec![None; keys.len()]));
        let mut slots: HashMap<[u8; DIGEST_SIZE], Vec<usize>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            slots.entry(key.digest).or_default().push(i);
        }
        let mut consumer = SlotConsumer {
            results: Arc::clone(&results),
            slots: Arc::new(slots),
        };

        let record = Record::new(HashMap::new(), 1, 0);
        consumer
            .consume(keys[0].clone(), Some(record))
            .unwrap();

        let results = results.lock();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[test]
    fn test_batch_child_digest_array_layout() {
        // The digest array field must be a flat n x 20 byte payload.
        let digests = vec![[1u8; DIGEST_SIZE], [2u8; DIGEST_SIZE]];
        let mut child = BatchChild {
            policy: BasePolicy::default(),
            node: Arc::new(crate::cluster::Node::new("127.0.0.1:3100", 1)),
            namespace: "ns".to_string(),
            digests,
            mode: BatchMode::ExistsOnly,
            parser: StreamParser::new(
                StreamKind::Batch,
                "ns",
                Arc::new(AtomicBool::new(false)),
            ),
            consumer: SlotConsumer {
                results: Arc::new(Mutex::new(vec![None; 2])),
                slots: Arc::new(HashMap::new()),
            },
        };

        let estimate = child.estimate_size().unwrap();
        let mut buf = vec![0u8; 1024];
        let mut w = MessageWriter::new(&mut buf);
        let total = child.write(&mut w).unwrap();
        assert_eq!(total, estimate);
        // Nothing consumed yet, so the child is still replayable.
        assert!(child.retryable());
    }
}
