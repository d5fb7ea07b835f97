//! Secondary-index queries streamed through a [`RecordSet`].

use std::sync::Arc;

use futures::future::BoxFuture;

use hivekv_common::error::{HiveError, Result};
use hivekv_common::policy::{BasePolicy, QueryPolicy};
use hivekv_common::protocol::{
    field_size, field_type, op_size, op_type, MessageWriter, INFO1_GET_ALL, INFO1_READ,
    MSG_TYPE_MESSAGE, TOTAL_HEADER_SIZE,
};
use hivekv_common::value::Value;

use crate::cluster::{Cluster, Node};
use crate::command::multi::{SinkConsumer, StreamKind, StreamParser};
use crate::command::{execute, Command, ParseStatus};
use crate::executor::MultiExecutor;
use crate::recordset::RecordSet;

/// A predicate over one indexed bin.
///
/// Encoded as an INDEX_RANGE field:
/// `name_len(1) | name | particle_type(1) | begin_len(4) | begin | end_len(4) | end`.
#[derive(Debug, Clone)]
pub struct Filter {
    bin_name: String,
    begin: Value,
    end: Value,
}

impl Filter {
    /// Matches records whose integer bin lies in `begin..=end`.
    pub fn range(bin_name: impl Into<String>, begin: i64, end: i64) -> Filter {
        Filter {
            bin_name: bin_name.into(),
            begin: Value::Int(begin),
            end: Value::Int(end),
        }
    }

    /// Matches records whose bin equals `value`.
    pub fn equal(bin_name: impl Into<String>, value: impl Into<Value>) -> Filter {
        let value = value.into();
        Filter {
            bin_name: bin_name.into(),
            begin: value.clone(),
            end: value,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        if self.bin_name.len() > u8::MAX as usize {
            return Err(HiveError::Serialize(format!(
                "filter bin name too long: {} bytes",
                self.bin_name.len()
            )));
        }
        let mut out = Vec::with_capacity(
            2 + self.bin_name.len() + 8 + self.begin.encoded_size() + self.end.encoded_size(),
        );
        out.push(self.bin_name.len() as u8);
        out.extend_from_slice(self.bin_name.as_bytes());
        out.push(self.begin.particle_type());
        out.extend_from_slice(&(self.begin.encoded_size() as u32).to_be_bytes());
        self.begin.write_to(&mut out);
        out.extend_from_slice(&(self.end.encoded_size() as u32).to_be_bytes());
        self.end.write_to(&mut out);
        Ok(out)
    }
}

/// What to query: the container, an optional filter, an optional bin
/// projection.
#[derive(Debug, Clone)]
pub struct Statement {
    pub namespace: String,
    pub set_name: String,
    pub bin_names: Option<Vec<String>>,
    pub filter: Option<Filter>,
}

impl Statement {
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>) -> Statement {
        Statement {
            namespace: namespace.into(),
            set_name: set_name.into(),
            bin_names: None,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Statement {
        self.filter = Some(filter);
        self
    }

    pub fn with_bins(mut self, bin_names: Vec<String>) -> Statement {
        self.bin_names = Some(bin_names);
        self
    }
}

/// Query request against one node.
struct QueryChild {
    policy: QueryPolicy,
    node: Arc<Node>,
    statement: Statement,
    parser: StreamParser,
    consumer: SinkConsumer,
}

impl Command for QueryChild {
    type Output = ();

    fn policy(&self) -> BasePolicy {
        self.policy.base.clone()
    }

    fn node(&mut self, _cluster: &Cluster, _iteration: u32) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.node))
    }

    fn estimate_size(&self) -> Result<usize> {
        let mut size = TOTAL_HEADER_SIZE
            + field_size(self.statement.namespace.len())
            + field_size(self.statement.set_name.len());
        if let Some(filter) = &self.statement.filter {
            size += field_size(filter.encode()?.len());
        }
        if let Some(names) = &self.statement.bin_names {
            for name in names {
                size += op_size(name.len(), 0);
            }
        }
        Ok(size)
    }

    fn write(&mut self, w: &mut MessageWriter<'_>) -> Result<usize> {
        let mut info1 = INFO1_READ;
        let bin_names = match &self.statement.bin_names {
            Some(names) if !names.is_empty() => names.as_slice(),
            _ => {
                info1 |= INFO1_GET_ALL;
                &[][..]
            }
        };
        let mut field_count = 2;

        w.begin_message()?;
        w.write_field_str(field_type::NAMESPACE, &self.statement.namespace)?;
        w.write_field_str(field_type::TABLE, &self.statement.set_name)?;
        if let Some(filter) = &self.statement.filter {
            w.write_field_bytes(field_type::INDEX_RANGE, &filter.encode()?)?;
            field_count += 1;
        }
        for name in bin_names {
            w.write_op(op_type::READ, name, &Value::Nil)?;
        }
        w.message_header(info1, 0, 0, 0, 0, field_count, bin_names.len() as u16);
        Ok(w.finish(MSG_TYPE_MESSAGE))
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Result<ParseStatus<Self::Output>> {
        self.parser.parse(frame, &mut self.consumer)
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.consumer.flush())
    }

    fn retryable(&self) -> bool {
        !self.parser.started()
    }
}

/// Runs `statement` on every node, streaming matches into a record set.
pub(crate) fn query(
    cluster: Arc<Cluster>,
    policy: QueryPolicy,
    statement: Statement,
) -> RecordSet {
    let (sink, set) = RecordSet::channel(policy.record_queue_size);
    let stop = sink.stop_flag();

    tokio::spawn(async move {
        let executor = MultiExecutor::new(Arc::clone(&stop));
        let children: Vec<_> = cluster
            .nodes()
            .to_vec()
            .into_iter()
            .map(|node| {
                let child = QueryChild {
                    policy: policy.clone(),
                    node,
                    statement: statement.clone(),
                    parser: StreamParser::new(
                        StreamKind::Query,
                        statement.namespace.clone(),
                        Arc::clone(&stop),
                    ),
                    consumer: SinkConsumer::new(sink.clone(), StreamKind::Query),
                };
                let cluster = Arc::clone(&cluster);
                async move { execute(&cluster, child).await }
            })
            .collect();

        let outcome = executor.run(policy.concurrent_nodes, children).await;
        sink.finish(outcome.err()).await;
    });

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_filter_encoding_layout() {
        let filter = Filter::range("age", 14, 18);
        let encoded = filter.encode().unwrap();
        assert_eq!(encoded[0], 3);
        assert_eq!(&encoded[1..4], b"age");
        // particle type, then two length-prefixed 8-byte integers
        assert_eq!(encoded.len(), 1 + 3 + 1 + 4 + 8 + 4 + 8);
        let begin = i64::from_be_bytes(encoded[9..17].try_into().unwrap());
        assert_eq!(begin, 14);
        let end = i64::from_be_bytes(encoded[21..29].try_into().unwrap());
        assert_eq!(end, 18);
    }

    #[test]
    fn test_equal_filter_has_matching_bounds() {
        let filter = Filter::equal("name", "ada");
        let encoded = filter.encode().unwrap();
        let begin_len = u32::from_be_bytes(encoded[6..10].try_into().unwrap()) as usize;
        assert_eq!(begin_len, 3);
    }

    #[test]
    fn test_query_request_estimate_covers_actual() {
        let (sink, _set) = RecordSet::channel(4);
        let statement = Statement::new("ns", "set").with_filter(Filter::range("n", 1, 50));
        let mut child = QueryChild {
            policy: QueryPolicy::default(),
            node: Arc::new(Node::new("127.0.0.1:3100", 1)),
            statement,
            parser: StreamParser::new(StreamKind::Query, "ns", Arc::new(AtomicBool::new(false))),
            consumer: SinkConsumer::new(sink, StreamKind::Query),
        };
        let estimate = child.estimate_size().unwrap();
        let mut buf = vec![0u8; 1024];
        let mut w = MessageWriter::new(&mut buf);
        let total = child.write(&mut w).unwrap();
        assert_eq!(total, estimate);
    }
}
