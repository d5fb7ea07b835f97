use thiserror::Error;

use crate::protocol::ResultCode;

/// Errors surfaced by the HiveKV client.
///
/// Errors are classified as retryable or non-retryable:
/// - **Retryable**: connection failures, invalid node references, timeouts
///   (subject to the command's retry policy)
/// - **Non-retryable**: parse errors, encoding errors, rejected commands,
///   terminated streams
#[derive(Error, Debug)]
pub enum HiveError {
    /// The command deadline elapsed before a server response arrived.
    #[error("command timed out after {timeout_ms}ms ({iterations} attempts, node: {node:?})")]
    Timeout {
        node: Option<String>,
        timeout_ms: u64,
        iterations: u32,
    },

    /// Socket connect or I/O failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The addressed node is absent from the current cluster map.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// The server sent a message the client could not decode.
    #[error("malformed server message: {0}")]
    Parse(String),

    /// Client-side encoding failure while building a request.
    #[error("encoding failed: {0}")]
    Serialize(String),

    /// A scan was aborted by the user or by a peer failure.
    #[error("scan terminated")]
    ScanTerminated,

    /// A query was aborted by the user or by a peer failure.
    #[error("query terminated")]
    QueryTerminated,

    /// Admission control refused the command because the event context pool
    /// was exhausted in non-blocking mode.
    #[error("command rejected: event context pool exhausted")]
    CommandRejected,

    /// The server returned a non-zero result code.
    #[error("server error: {0}")]
    ServerError(ResultCode),

    /// Underlying I/O error that did not map onto a more specific kind.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HiveError {
    /// Whether a fresh attempt against the cluster may succeed.
    ///
    /// Timeouts are listed here but are additionally gated by the command's
    /// `retry_on_timeout` policy in the execution engine.
    pub fn is_retryable(&self) -> bool {
        match self {
            HiveError::Connection(_) => true,
            HiveError::InvalidNode(_) => true,
            HiveError::Timeout { .. } => true,
            HiveError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ),
            HiveError::ServerError(code) => code.is_retryable(),
            _ => false,
        }
    }

    /// Whether the connection that produced this error is still usable.
    ///
    /// Application-level server errors leave the stream framing intact, so
    /// the connection can go back to the pool. Anything else may have left
    /// garbage on the wire and the connection must be closed.
    pub fn keep_connection(&self) -> bool {
        match self {
            HiveError::ServerError(code) => code.keep_connection(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
