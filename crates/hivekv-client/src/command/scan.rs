//! Full-namespace scans streamed through a [`RecordSet`].

use std::sync::Arc;

use futures::future::BoxFuture;

use hivekv_common::error::Result;
use hivekv_common::policy::{BasePolicy, ScanPolicy};
use hivekv_common::protocol::{
    field_size, field_type, op_size, op_type, MessageWriter, INFO1_GET_ALL, INFO1_NOBINDATA,
    INFO1_READ, MSG_TYPE_MESSAGE, TOTAL_HEADER_SIZE,
};
use hivekv_common::value::Value;

use crate::cluster::{Cluster, Node};
use crate::command::multi::{SinkConsumer, StreamKind, StreamParser};
use crate::command::{execute, Command, ParseStatus};
use crate::executor::MultiExecutor;
use crate::recordset::RecordSet;

/// Scan request against one node.
struct ScanChild {
    policy: ScanPolicy,
    node: Arc<Node>,
    namespace: String,
    set_name: String,
    bin_names: Option<Vec<String>>,
    parser: StreamParser,
    consumer: SinkConsumer,
}

impl ScanChild {
    /// `priority << 4 | fail-on-cluster-change bit`, then the percentage.
    fn scan_options(&self) -> [u8; 2] {
        let mut flags = self.policy.priority << 4;
        if self.policy.fail_on_cluster_change {
            flags |= 0x08;
        }
        [flags, self.policy.scan_percent]
    }
}

impl Command for ScanChild {
    type Output = ();

    fn policy(&self) -> BasePolicy {
        self.policy.base.clone()
    }

    fn node(&mut self, _cluster: &Cluster, _iteration: u32) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.node))
    }

    fn estimate_size(&self) -> Result<usize> {
        let mut size = TOTAL_HEADER_SIZE
            + field_size(self.namespace.len())
            + field_size(self.set_name.len())
            + field_size(2);
        if let Some(names) = &self.bin_names {
            for name in names {
                size += op_size(name.len(), 0);
            }
        }
        Ok(size)
    }

    fn write(&mut self, w: &mut MessageWriter<'_>) -> Result<usize> {
        let mut info1 = INFO1_READ;
        let bin_names = match (&self.bin_names, self.policy.include_bin_data) {
            (_, false) => {
                info1 |= INFO1_NOBINDATA;
                &[][..]
            }
            (Some(names), true) if !names.is_empty() => names.as_slice(),
            _ => {
                info1 |= INFO1_GET_ALL;
                &[][..]
            }
        };

        w.begin_message()?;
        w.write_field_str(field_type::NAMESPACE, &self.namespace)?;
        w.write_field_str(field_type::TABLE, &self.set_name)?;
        w.write_field_bytes(field_type::SCAN_OPTIONS, &self.scan_options())?;
        for name in bin_names {
            w.write_op(op_type::READ, name, &Value::Nil)?;
        }
        w.message_header(info1, 0, 0, 0, 0, 3, bin_names.len() as u16);
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

/// Scans every record of `(namespace, set)` across the cluster, streaming
/// results as they arrive. Node order is unspecified; records within one
/// node arrive in server order.
pub(crate) fn scan_all(
    cluster: Arc<Cluster>,
    policy: ScanPolicy,
    namespace: String,
    set_name: String,
    bin_names: Option<Vec<String>>,
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
                let child = ScanChild {
                    policy: policy.clone(),
                    node,
                    namespace: namespace.clone(),
                    set_name: set_name.clone(),
                    bin_names: bin_names.clone(),
                    parser: StreamParser::new(
                        StreamKind::Scan,
                        namespace.clone(),
                        Arc::clone(&stop),
                    ),
                    consumer: SinkConsumer::new(sink.clone(), StreamKind::Scan),
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
