//! The per-command execution engine.
//!
//! Every command attempt moves through connect → authenticate → send →
//! receive → parse, with its progress tracked by an atomic state word. The
//! only legal transitions are compare-and-swaps from `IN_PROGRESS` to one
//! terminal state; exactly one such swap succeeds per attempt, which is what
//! guarantees one completion, one buffer release, and one connection
//! disposition no matter how the I/O path and the timeout supervisor race.
//!
//! A retry is a fresh attempt value inheriting the event context, buffer and
//! retry counter: the previous attempt's state word is swapped to `RETRY`
//! and becomes unreachable to everything but the supervisor sweep, which
//! drops non-in-progress entries.

pub mod batch;
pub mod multi;
pub mod query;
pub mod scan;
pub mod single;

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use hivekv_common::error::{HiveError, Result};
use hivekv_common::policy::BasePolicy;
use hivekv_common::protocol::{
    parse_proto_header, stamp_timeout, MessageWriter, PROTO_HEADER_SIZE, TOTAL_HEADER_SIZE,
};

use crate::cluster::{Cluster, Node};
use crate::event::EventContext;

/// Command states. The word starts at `IN_PROGRESS`; every other value is
/// terminal for its attempt.
pub(crate) mod state {
    pub const IN_PROGRESS: u8 = 0;
    pub const SUCCESS: u8 = 1;
    pub const RETRY: u8 = 2;
    pub const FAIL_TIMEOUT: u8 = 3;
    pub const FAIL_NETWORK_INIT: u8 = 4;
    pub const FAIL_NETWORK_ERROR: u8 = 5;
    pub const FAIL_APPLICATION_INIT: u8 = 6;
    pub const FAIL_APPLICATION_ERROR: u8 = 7;
}

/// Shared state word for one command attempt, plus the abort signal the
/// timeout supervisor uses to interrupt a pending socket operation.
#[derive(Debug)]
pub struct CommandState {
    status: AtomicU8,
    abort: Notify,
}

impl CommandState {
    pub fn new() -> CommandState {
        CommandState {
            status: AtomicU8::new(state::IN_PROGRESS),
            abort: Notify::new(),
        }
    }

    pub fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    /// The terminal compare-and-swap. Returns true for the single winner.
    pub fn try_transition(&self, to: u8) -> bool {
        self.status
            .compare_exchange(
                state::IN_PROGRESS,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Wakes the attempt out of any pending socket operation. The permit is
    /// stored, so an abort that fires before the attempt reaches its next
    /// await is not lost.
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    /// Resolves once the attempt has been aborted.
    pub async fn aborted(&self) {
        self.abort.notified().await;
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of parsing one received frame.
pub(crate) enum ParseStatus<T> {
    /// The stream continues; read another frame.
    Continue,
    /// The command is complete.
    Done(T),
}

/// One executable command. Implementations supply the target node, the
/// request bytes and the response parser; the driver owns everything else.
pub(crate) trait Command: Send {
    type Output: Send;

    fn policy(&self) -> BasePolicy;

    /// Resolves the node for this attempt. Single-record commands key this
    /// off the partition map; fan-out children carry their node explicitly.
    fn node(&mut self, cluster: &Cluster, iteration: u32) -> Result<Arc<Node>>;

    /// Upper bound on the encoded request size. Writing past this bound is a
    /// fatal client error, never a retry.
    fn estimate_size(&self) -> Result<usize>;

    /// Encodes the request and returns its total length.
    fn write(&mut self, w: &mut MessageWriter<'_>) -> Result<usize>;

    /// Consumes one received frame body.
    fn parse_frame(&mut self, frame: &[u8]) -> Result<ParseStatus<Self::Output>>;

    /// Forwards rows parsed from the previous frame to their destination,
    /// applying backpressure. Single-record commands have nothing to do;
    /// streaming commands drain into their bounded queue here, between
    /// frames, so a slow consumer stalls the socket instead of the heap.
    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    /// Whether a fresh attempt may be started after a network-class failure.
    /// Streaming commands return false once records have been consumed.
    fn retryable(&self) -> bool {
        true
    }
}

struct AttemptFailure {
    state: u8,
    error: HiveError,
}

impl AttemptFailure {
    fn new(state: u8, error: HiveError) -> AttemptFailure {
        AttemptFailure { state, error }
    }

    /// Classifies a failure that happened before any request byte was sent.
    fn init(error: HiveError) -> AttemptFailure {
        let state = match &error {
            HiveError::Connection(_)
            | HiveError::InvalidNode(_)
            | HiveError::Io(_)
            | HiveError::Timeout { .. } => state::FAIL_NETWORK_INIT,
            _ => state::FAIL_APPLICATION_INIT,
        };
        AttemptFailure { state, error }
    }
}

/// Runs `cmd` to completion: acquires an event context (parking or rejecting
/// per the pool mode), drives attempts until a terminal transition, and
/// releases the context afterwards. The result reaches the caller only after
/// connection and context are back in their pools.
pub(crate) async fn execute<C: Command>(cluster: &Arc<Cluster>, mut cmd: C) -> Result<C::Output> {
    let mut ctx = cluster.event_pool().acquire().await?;
    cluster.refresh_segment(&mut ctx).await;
    let result = drive(cluster, &mut cmd, &mut ctx).await;
    ctx.restore_segment();
    cluster.event_pool().release(ctx);
    result
}

async fn drive<C: Command>(
    cluster: &Arc<Cluster>,
    cmd: &mut C,
    ctx: &mut EventContext,
) -> Result<C::Output> {
    let policy = cmd.policy();
    let timeout = Duration::from_millis(policy.timeout_ms);
    let mut deadline = (policy.timeout_ms > 0).then(|| Instant::now() + timeout);
    let mut iterations: u32 = 0;
    let mut last_node: Option<String> = None;

    loop {
        let cstate = Arc::new(CommandState::new());
        if let Some(dl) = deadline {
            cluster.supervisor().register(Arc::clone(&cstate), dl);
        }

        match attempt(cluster, cmd, ctx, &cstate, deadline, iterations, &mut last_node).await {
            Ok(output) => {
                if cstate.try_transition(state::SUCCESS) {
                    return Ok(output);
                }
                // The supervisor won between parse and completion; the
                // result is discarded and the timeout surfaces instead.
                return Err(timeout_error(&last_node, &policy, iterations));
            }
            Err(failure) => {
                if cstate.status() == state::FAIL_TIMEOUT {
                    // Already completed by the supervisor. Whatever the I/O
                    // path observed after the socket was torn down is noise.
                    // A timed-out attempt is only worth repeating when the
                    // stopwatch restarts per attempt.
                    if policy.retry_on_timeout
                        && cmd.retryable()
                        && iterations < policy.max_retries
                    {
                        iterations += 1;
                        tracing::debug!(iteration = iterations, "retrying after deadline");
                        deadline = Some(Instant::now() + timeout);
                        sleep_between_retries(&policy).await;
                        continue;
                    }
                    return Err(timeout_error(&last_node, &policy, iterations));
                }

                let within_budget = policy.retry_on_timeout
                    || deadline.map_or(true, |dl| Instant::now() < dl);
                let can_retry = failure.error.is_retryable()
                    && cmd.retryable()
                    && iterations < policy.max_retries
                    && within_budget;

                if !can_retry {
                    cstate.try_transition(failure.state);
                    return Err(failure.error);
                }
                if !cstate.try_transition(state::RETRY) {
                    return Err(timeout_error(&last_node, &policy, iterations));
                }

                iterations += 1;
                tracing::debug!(
                    iteration = iterations,
                    max_retries = policy.max_retries,
                    error = %failure.error,
                    "retrying command"
                );
                // A fresh stopwatch only when timeouts restart per attempt;
                // otherwise the original deadline is inherited.
                if policy.retry_on_timeout && policy.timeout_ms > 0 {
                    deadline = Some(Instant::now() + timeout);
                }
                sleep_between_retries(&policy).await;
            }
        }
    }
}

async fn attempt<C: Command>(
    cluster: &Arc<Cluster>,
    cmd: &mut C,
    ctx: &mut EventContext,
    cstate: &CommandState,
    deadline: Option<Instant>,
    iteration: u32,
    last_node: &mut Option<String>,
) -> std::result::Result<C::Output, AttemptFailure> {
    let node = cmd.node(cluster, iteration).map_err(AttemptFailure::init)?;
    *last_node = Some(node.name().to_string());

    let mut conn = io_with_abort(cstate, node.get_connection(cluster.config()))
        .await
        .map_err(AttemptFailure::init)?;

    // Build the request into the context's segment. A subclass whose actual
    // bytes exceed its estimate fails here with a non-retryable error.
    let estimate = match cmd.estimate_size() {
        Ok(estimate) => estimate.max(TOTAL_HEADER_SIZE),
        Err(e) => {
            conn.close().await;
            return Err(AttemptFailure::new(state::FAIL_APPLICATION_INIT, e));
        }
    };
    ctx.ensure_capacity(estimate);
    let total = {
        let mut writer = MessageWriter::new(ctx.segment().as_mut_slice());
        match cmd.write(&mut writer) {
            Ok(total) => total,
            Err(e) => {
                conn.close().await;
                return Err(AttemptFailure::new(state::FAIL_APPLICATION_INIT, e));
            }
        }
    };

    // Stamp the remaining server-side budget just before send.
    let remaining_ms = deadline
        .map(|dl| dl.saturating_duration_since(Instant::now()).as_millis() as u32)
        .unwrap_or(0);
    stamp_timeout(ctx.segment().as_mut_slice(), remaining_ms);

    if let Err(e) = io_with_abort(cstate, conn.send_all(&ctx.segment_ref().as_slice()[..total])).await
    {
        conn.close().await;
        return Err(AttemptFailure::new(state::FAIL_NETWORK_ERROR, e));
    }

    loop {
        // Phase A: exactly eight header bytes. A declared length of zero is
        // a keep-alive; re-read a fresh header.
        let mut header = [0u8; PROTO_HEADER_SIZE];
        if let Err(e) = io_with_abort(cstate, conn.recv_exact(&mut header)).await {
            conn.close().await;
            return Err(AttemptFailure::new(state::FAIL_NETWORK_ERROR, e));
        }
        let body_len = match parse_proto_header(&header) {
            Ok((_, _, len)) => len as usize,
            Err(e) => {
                conn.close().await;
                return Err(AttemptFailure::new(state::FAIL_APPLICATION_ERROR, e));
            }
        };
        if body_len == 0 {
            continue;
        }

        // Phase B: the declared body, resizing the segment when the stream
        // outgrows it.
        ctx.ensure_capacity(body_len);
        if let Err(e) =
            io_with_abort(cstate, conn.recv_exact(&mut ctx.segment().as_mut_slice()[..body_len]))
                .await
        {
            conn.close().await;
            return Err(AttemptFailure::new(state::FAIL_NETWORK_ERROR, e));
        }
        conn.update_last_used();

        match cmd.parse_frame(&ctx.segment_ref().as_slice()[..body_len]) {
            Ok(ParseStatus::Done(output)) => {
                if let Err(e) = io_with_abort(cstate, cmd.flush()).await {
                    // Stream fully consumed; the connection is clean.
                    node.put_connection(conn).await;
                    return Err(AttemptFailure::new(state::FAIL_APPLICATION_ERROR, e));
                }
                node.put_connection(conn).await;
                return Ok(output);
            }
            Ok(ParseStatus::Continue) => {
                if let Err(e) = io_with_abort(cstate, cmd.flush()).await {
                    // Abandoning mid-stream leaves unread frames behind.
                    conn.close().await;
                    return Err(AttemptFailure::new(state::FAIL_APPLICATION_ERROR, e));
                }
                continue;
            }
            Err(e) => {
                // Application errors that left the framing intact return the
                // connection; anything else may have garbage on the wire.
                if e.keep_connection() {
                    node.put_connection(conn).await;
                } else {
                    conn.close().await;
                }
                return Err(AttemptFailure::new(state::FAIL_APPLICATION_ERROR, e));
            }
        }
    }
}

/// Races a socket operation against the supervisor's abort signal.
async fn io_with_abort<T, F>(cstate: &CommandState, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = op => result,
        _ = cstate.aborted() => Err(HiveError::Connection(
            "socket operation aborted by deadline supervisor".to_string(),
        )),
    }
}

fn timeout_error(node: &Option<String>, policy: &BasePolicy, iterations: u32) -> HiveError {
    HiveError::Timeout {
        node: node.clone(),
        timeout_ms: policy.timeout_ms,
        iterations: iterations + 1,
    }
}

async fn sleep_between_retries(policy: &BasePolicy) {
    let base = policy.sleep_between_retries_ms;
    if base == 0 {
        return;
    }
    // Small random jitter to keep concurrent retries from stampeding.
    let jitter = if base >= 10 && rand::random::<bool>() {
        rand::random::<u64>() % (base / 10 + 1)
    } else {
        0
    };
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}
