//! Cluster state: nodes, the partition map, and the shared pools.

mod node;

pub use node::Node;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use hivekv_common::buffer::{BufferPool, BUFFER_CUTOFF};
use hivekv_common::error::{HiveError, Result};
use hivekv_common::key::PARTITIONS;
use hivekv_common::policy::{ClientConfig, Replica};

use crate::event::{EventContext, EventPool};
use crate::timeout::TimeoutSupervisor;

/// A connected cluster.
///
/// Owns the node set, the digest-keyed partition map, the shared buffer
/// arena, the event context pool, and the timeout supervisor. Partition map
/// maintenance is not performed here: the map is striped over the seed nodes
/// at connect time and stays fixed for the life of the handle.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    /// Per partition: indices into `nodes`, master first.
    partition_map: Vec<Vec<usize>>,
    buffer_pool: BufferPool,
    event_pool: EventPool,
    supervisor: TimeoutSupervisor,
    config: ClientConfig,
    tender: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Builds a cluster handle over the given seed addresses and starts the
    /// background tasks (timeout supervisor, idle-connection tender).
    pub async fn connect(config: ClientConfig, seeds: &[&str]) -> Result<Arc<Cluster>> {
        if seeds.is_empty() {
            return Err(HiveError::InvalidNode("no seed nodes given".to_string()));
        }

        let nodes: Vec<Arc<Node>> = seeds
            .iter()
            .map(|addr| Arc::new(Node::new(*addr, config.max_conns_per_node)))
            .collect();

        // Stripe partitions round-robin across the nodes; the next node in
        // sequence acts as the prole replica.
        let replica_count = nodes.len().min(2);
        let mut partition_map = Vec::with_capacity(PARTITIONS);
        for partition in 0..PARTITIONS {
            let mut replicas = Vec::with_capacity(replica_count);
            for r in 0..replica_count {
                replicas.push((partition + r) % nodes.len());
            }
            partition_map.push(replicas);
        }

        let buffer_pool = BufferPool::new(config.buffer_pool_size);
        let event_pool = EventPool::new(
            config.event_pool_size,
            config.block_on_full_pool,
            &buffer_pool,
        )
        .await;
        let supervisor = TimeoutSupervisor::start(Duration::from_millis(config.supervisor_tick_ms));

        let cluster = Arc::new(Cluster {
            nodes,
            partition_map,
            buffer_pool,
            event_pool,
            supervisor,
            config,
            tender: Mutex::new(None),
        });

        let tender = tokio::spawn(tend(Arc::clone(&cluster)));
        *cluster.tender.lock() = Some(tender);

        tracing::info!(
            nodes = cluster.nodes.len(),
            event_contexts = cluster.event_pool.total(),
            "cluster handle ready"
        );
        Ok(cluster)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn event_pool(&self) -> &EventPool {
        &self.event_pool
    }

    pub(crate) fn supervisor(&self) -> &TimeoutSupervisor {
        &self.supervisor
    }

    /// Resolves the node serving `partition_id` under the given replica
    /// policy. With `MasterProles`, successive iterations rotate through the
    /// partition's replicas so a retry lands elsewhere.
    pub(crate) fn get_node(
        &self,
        partition_id: usize,
        replica: Replica,
        iteration: u32,
    ) -> Result<Arc<Node>> {
        let replicas = self.partition_map.get(partition_id).ok_or_else(|| {
            HiveError::InvalidNode(format!("partition {} out of range", partition_id))
        })?;
        let index = match replica {
            Replica::Master => replicas[0],
            Replica::MasterProles => replicas[iteration as usize % replicas.len()],
        };
        let node = &self.nodes[index];
        if !node.is_active() {
            return Err(HiveError::InvalidNode(format!(
                "node {} is inactive",
                node.name()
            )));
        }
        Ok(Arc::clone(node))
    }

    /// Exchanges a context's segment when the buffer pool generation moved
    /// while the context was at rest, so the command starts on live memory.
    pub(crate) async fn refresh_segment(&self, ctx: &mut EventContext) {
        if self.buffer_pool.has_buffer_changed(ctx.segment_ref()) {
            let fresh = self.buffer_pool.get_next(BUFFER_CUTOFF).await;
            let stale = ctx.swap_segment(fresh);
            self.buffer_pool.put(stale).await;
        }
    }

    /// Stops background tasks and closes every pooled connection. In-flight
    /// commands finish on their own sockets.
    pub async fn close(&self) {
        if let Some(tender) = self.tender.lock().take() {
            tender.abort();
        }
        self.supervisor.shutdown();
        for node in &self.nodes {
            node.deactivate();
            node.close_all().await;
        }
        tracing::info!("cluster handle closed");
    }
}

async fn tend(cluster: Arc<Cluster>) {
    let max_idle = Duration::from_secs(cluster.config.max_socket_idle_s);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        for node in &cluster.nodes {
            node.tend_idle(max_idle).await;
        }
    }
}
