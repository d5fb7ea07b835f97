//! HiveKV Client
//!
//! This crate provides the asynchronous command execution engine for HiveKV
//! clusters.
//!
//! # Overview
//!
//! [`HiveClient`] issues single-record and multi-record commands to a cluster
//! of server nodes over a length-framed binary protocol, with per-command
//! deadlines, bounded retries, connection pooling and buffer reuse.
//!
//! # Key Features
//!
//! - **Bounded in-flight work**: every command owns one pooled event context;
//!   an exhausted pool either parks commands FIFO or rejects immediately,
//!   per configuration
//! - **Deadline supervision**: a dedicated supervisor task fails commands
//!   whose deadline elapses and tears down their socket operation
//! - **Automatic retries**: network-class failures retry up to the policy
//!   limit, inheriting the original deadline unless configured otherwise
//! - **Connection reuse**: per-node bounded pools with idle eviction;
//!   connections survive application-level server errors and are closed on
//!   anything that could desynchronize framing
//! - **Streaming fan-out**: batch, scan and query commands run one child per
//!   node, aggregate the first failure, and deliver records through bounded
//!   queues
//!
//! # Usage
//!
//! ```rust,no_run
//! use hivekv_client::HiveClient;
//! use hivekv_common::{Bin, ClientConfig, Key};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HiveClient::connect(ClientConfig::default(), &["127.0.0.1:3100"]).await?;
//!
//!     let key = Key::new("test", "demo", "user-1")?;
//!     client.put(&Default::default(), &key, &[Bin::new("visits", 1i64)]).await?;
//!     let record = client.get(&Default::default(), &key, None).await?;
//!     println!("{:?}", record);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Completion semantics
//!
//! Exactly one of success or failure is delivered per command, after its
//! connection and event context have returned to their pools. The one
//! documented exception: a sequence listener whose own `on_record` fails
//! observes that error again through `on_failure`.

pub mod client;
pub mod cluster;
pub mod event;
pub mod listener;
pub mod recordset;
pub mod timeout;

mod command;
mod executor;

pub use client::HiveClient;
pub use cluster::{Cluster, Node};
pub use command::query::{Filter, Statement};
pub use command::single::Operation;
pub use event::{EventContext, EventPool};
pub use recordset::RecordSet;
pub use timeout::TimeoutSupervisor;
