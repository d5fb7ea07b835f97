//! Per-command and per-client configuration.

use serde::{Deserialize, Serialize};

/// What to do when a write targets an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordExistsAction {
    /// Create or update the record unconditionally.
    Update,
    /// Update only if the submitted generation equals the server's.
    ExpectGenEqual,
    /// Update only if the submitted generation is greater than the server's.
    ExpectGenGreater,
    /// Fail if the record already exists.
    Fail,
}

/// Which replica of a partition serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replica {
    /// Always the partition master.
    Master,
    /// Master first, then proles on subsequent attempts.
    MasterProles,
}

/// Options shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasePolicy {
    /// Total command deadline in milliseconds. 0 disables the deadline and
    /// the timeout supervisor for this command.
    pub timeout_ms: u64,
    /// Maximum retries after the first attempt. 0 means a single attempt.
    pub max_retries: u32,
    /// Whether a deadline that elapsed mid-attempt restarts on retry. When
    /// false the original stopwatch is inherited across attempts.
    pub retry_on_timeout: bool,
    /// Pause between attempts in milliseconds.
    pub sleep_between_retries_ms: u64,
    /// Replica selection for reads.
    pub replica: Replica,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            max_retries: 2,
            retry_on_timeout: false,
            sleep_between_retries_ms: 10,
            replica: Replica::Master,
        }
    }
}

/// Options for single-record writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WritePolicy {
    pub base: BasePolicy,
    #[serde(default = "default_record_exists_action")]
    pub record_exists_action: RecordExistsAction,
    /// Expected generation, consulted by the generation-gated actions.
    pub generation: u32,
    /// Record TTL in seconds. 0 uses the namespace default.
    pub expiration: u32,
}

fn default_record_exists_action() -> RecordExistsAction {
    RecordExistsAction::Update
}

impl Default for RecordExistsAction {
    fn default() -> Self {
        RecordExistsAction::Update
    }
}

/// Options for scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub base: BasePolicy,
    /// Number of nodes scanned in parallel. 0 scans all nodes at once,
    /// 1 scans sequentially.
    pub concurrent_nodes: usize,
    /// Whether record bins are returned or only metadata.
    pub include_bin_data: bool,
    /// Percentage of records to return, 1..=100.
    pub scan_percent: u8,
    /// Abort the scan if the cluster map changes while it runs.
    pub fail_on_cluster_change: bool,
    /// Server-side scan priority, 0 = auto.
    pub priority: u8,
    /// Capacity of the record set's internal queue.
    pub record_queue_size: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                // Scans stream for a while; no deadline by default.
                timeout_ms: 0,
                max_retries: 0,
                ..BasePolicy::default()
            },
            concurrent_nodes: 0,
            include_bin_data: true,
            scan_percent: 100,
            fail_on_cluster_change: false,
            priority: 0,
            record_queue_size: 4096,
        }
    }
}

/// Options for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPolicy {
    pub base: BasePolicy,
    /// Number of nodes queried in parallel. 0 queries all nodes at once.
    pub concurrent_nodes: usize,
    /// Capacity of the record set's internal queue.
    pub record_queue_size: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                timeout_ms: 0,
                max_retries: 0,
                ..BasePolicy::default()
            },
            concurrent_nodes: 0,
            record_queue_size: 4096,
        }
    }
}

/// Options for batch commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPolicy {
    pub base: BasePolicy,
    /// Child commands dispatched in parallel. 0 dispatches all at once,
    /// 1 runs children sequentially, n bounds the fan-out.
    pub max_concurrent_nodes: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::default(),
            max_concurrent_nodes: 0,
        }
    }
}

/// Client-wide configuration, fixed at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Number of reusable event contexts; bounds concurrent in-flight commands.
    pub event_pool_size: usize,
    /// When the event context pool is exhausted: park commands FIFO (true) or
    /// reject immediately with `CommandRejected` (false).
    pub block_on_full_pool: bool,
    /// Maximum pooled connections per node.
    pub max_conns_per_node: usize,
    /// Pooled connections idle longer than this many seconds are closed.
    pub max_socket_idle_s: u64,
    /// TCP connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout supervisor sweep interval in milliseconds.
    pub supervisor_tick_ms: u64,
    /// Number of pooled message buffers.
    pub buffer_pool_size: usize,
    /// Credentials; when set, fresh connections authenticate before use.
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            event_pool_size: num_cpus_default(),
            block_on_full_pool: true,
            max_conns_per_node: 64,
            max_socket_idle_s: 55,
            connect_timeout_ms: 3000,
            supervisor_tick_ms: 10,
            buffer_pool_size: num_cpus_default(),
            user: None,
            password: None,
        }
    }
}

fn num_cpus_default() -> usize {
    num_cpus::get() * 4
}
