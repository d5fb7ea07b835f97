//! Low-level async connection to a single node.

use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{HiveError, Result};

/// One TCP connection to a node endpoint.
///
/// The connection is unaware of commands; callers hand it exact byte ranges
/// to send or fill. Short reads and writes are absorbed internally by
/// looping; a zero-byte read means the peer closed the stream, which is
/// reported as a retryable connection error.
#[derive(Debug)]
pub struct AsyncConnection {
    stream: TcpStream,
    last_used: Instant,
}

impl AsyncConnection {
    /// Connects to `addr`, resolving and trying each candidate address until
    /// one succeeds, bounded by `connect_timeout`.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<AsyncConnection> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| HiveError::Connection(format!("invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| map_io_error(e, "configuring socket"))?;
                    return Ok(AsyncConnection {
                        stream,
                        last_used: Instant::now(),
                    });
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("connect timed out after {:?}", connect_timeout)),
            }
        }

        Err(HiveError::Connection(format!(
            "failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Sends the whole of `buf`, looping over short writes.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self
                .stream
                .write(&buf[sent..])
                .await
                .map_err(|e| map_io_error(e, "sending request"))?;
            if n == 0 {
                return Err(HiveError::Connection("peer closed during send".to_string()));
            }
            sent += n;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing request"))?;
        Ok(())
    }

    /// Fills the whole of `buf`, looping over short reads.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut received = 0;
        while received < buf.len() {
            let n = self
                .stream
                .read(&mut buf[received..])
                .await
                .map_err(|e| map_io_error(e, "receiving response"))?;
            if n == 0 {
                return Err(HiveError::Connection(
                    "peer closed during receive".to_string(),
                ));
            }
            received += n;
        }
        Ok(())
    }

    pub fn update_last_used(&mut self) {
        self.last_used = Instant::now();
    }

    /// Time since the connection last completed an exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Shuts the connection down. Errors are ignored; the socket is gone
    /// either way.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn map_io_error(err: std::io::Error, context: &str) -> HiveError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            HiveError::Connection(format!("{}: {}", context, err))
        }
        _ => HiveError::Io(err),
    }
}
