//! Nodes and their connection pools.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use hivekv_common::auth::authenticate;
use hivekv_common::error::Result;
use hivekv_common::policy::ClientConfig;
use hivekv_common::transport::AsyncConnection;

/// One server in the cluster map.
pub struct Node {
    name: String,
    address: String,
    pool: NodeConnectionPool,
    active: AtomicBool,
}

impl Node {
    pub(crate) fn new(address: impl Into<String>, max_conns: usize) -> Node {
        let address = address.into();
        Node {
            name: address.clone(),
            address,
            pool: NodeConnectionPool::new(max_conns),
            active: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Pooled connections currently idle on this node.
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }

    /// Returns a warm pooled connection or opens a fresh one, running the
    /// authentication exchange when credentials are configured.
    pub(crate) async fn get_connection(&self, config: &ClientConfig) -> Result<AsyncConnection> {
        let max_idle = Duration::from_secs(config.max_socket_idle_s);
        while let Some(conn) = self.pool.get() {
            if conn.idle_for() <= max_idle {
                return Ok(conn);
            }
            tracing::debug!(node = %self.name, "discarding idle pooled connection");
            conn.close().await;
        }

        let mut conn = AsyncConnection::connect(
            &self.address,
            Duration::from_millis(config.connect_timeout_ms),
        )
        .await?;
        if let Some(user) = &config.user {
            if let Err(e) =
                authenticate(&mut conn, user, config.password.as_deref().unwrap_or("")).await
            {
                conn.close().await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    /// Returns a healthy connection to the pool; overflow is closed.
    pub(crate) async fn put_connection(&self, conn: AsyncConnection) {
        if let Some(rejected) = self.pool.put(conn) {
            rejected.close().await;
        }
    }

    /// Closes pooled connections idle longer than `max_idle`. Run by the
    /// cluster tender.
    pub(crate) async fn tend_idle(&self, max_idle: Duration) {
        for conn in self.pool.evict_idle(max_idle) {
            tracing::debug!(node = %self.name, "closing idle connection");
            conn.close().await;
        }
    }

    pub(crate) async fn close_all(&self) {
        for conn in self.pool.drain() {
            conn.close().await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Per-node bounded pool of live connections. Most-recently-used first, so
/// warm sockets stay warm and stale ones age out at the back.
pub(crate) struct NodeConnectionPool {
    conns: Mutex<VecDeque<AsyncConnection>>,
    max: usize,
}

impl NodeConnectionPool {
    fn new(max: usize) -> NodeConnectionPool {
        NodeConnectionPool {
            conns: Mutex::new(VecDeque::new()),
            max,
        }
    }

    fn len(&self) -> usize {
        self.conns.lock().len()
    }

    fn get(&self) -> Option<AsyncConnection> {
        self.conns.lock().pop_front()
    }

    /// Accepts the connection unless the pool is full; a full pool hands it
    /// back for the caller to close.
    fn put(&self, conn: AsyncConnection) -> Option<AsyncConnection> {
        let mut conns = self.conns.lock();
        if conns.len() < self.max {
            conns.push_front(conn);
            None
        } else {
            Some(conn)
        }
    }

    fn evict_idle(&self, max_idle: Duration) -> Vec<AsyncConnection> {
        let mut conns = self.conns.lock();
        let mut evicted = Vec::new();
        while let Some(conn) = conns.back() {
            if conn.idle_for() > max_idle {
                if let Some(conn) = conns.pop_back() {
                    evicted.push(conn);
                }
            } else {
                break;
            }
        }
        evicted
    }

    fn drain(&self) -> Vec<AsyncConnection> {
        self.conns.lock().drain(..).collect()
    }
}
