//! The public client facade.

use std::sync::Arc;

use hivekv_common::error::Result;
use hivekv_common::key::Key;
use hivekv_common::policy::{BasePolicy, BatchPolicy, ClientConfig, QueryPolicy, ScanPolicy, WritePolicy};
use hivekv_common::protocol::op_type;
use hivekv_common::record::Record;
use hivekv_common::value::{Bin, Value};

use crate::cluster::Cluster;
use crate::command::batch::{batch_exists, batch_get};
use crate::command::query::{query, Statement};
use crate::command::scan::scan_all;
use crate::command::single::{
    DeleteCommand, ExecuteUdfCommand, ExistsCommand, OperateCommand, Operation, ReadCommand,
    TouchCommand, WriteCommand,
};
use crate::command::execute;
use crate::listener::{
    BatchListListener, DeleteListener, ExecuteListener, ExistsArrayListener, ExistsListener,
    RecordListener, RecordSequenceListener, WriteListener,
};
use crate::recordset::RecordSet;

/// Asynchronous HiveKV client.
///
/// Cheap to clone; clones share the cluster handle, its connection pools and
/// its event context pool. Every method is usable from any task; results are
/// delivered after the command's connection and context have returned to
/// their pools.
///
/// # Example
///
/// ```no_run
/// use hivekv_client::HiveClient;
/// use hivekv_common::{Bin, ClientConfig, Key, WritePolicy};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HiveClient::connect(ClientConfig::default(), &["127.0.0.1:3100"]).await?;
///
/// let key = Key::new("test", "demo", "user-1")?;
/// client.put(&WritePolicy::default(), &key, &[Bin::new("name", "ada")]).await?;
///
/// let record = client.get(&Default::default(), &key, None).await?;
/// println!("{:?}", record);
/// # Ok(())
/// # }
/// ```
pub struct HiveClient {
    cluster: Arc<Cluster>,
}

impl HiveClient {
    /// Connects to a cluster through the given seed addresses.
    pub async fn connect(config: ClientConfig, seeds: &[&str]) -> Result<HiveClient> {
        let cluster = Cluster::connect(config, seeds).await?;
        Ok(HiveClient { cluster })
    }

    /// The underlying cluster handle.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Stops background tasks and closes pooled connections.
    pub async fn close(&self) {
        self.cluster.close().await;
    }

    /// Writes bins to a record, honoring the policy's record-exists action
    /// and generation gates.
    pub async fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        let cmd = WriteCommand::new(policy.clone(), key.clone(), bins.to_vec(), op_type::WRITE);
        execute(&self.cluster, cmd).await
    }

    /// Appends to string bins.
    pub async fn append(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        let cmd = WriteCommand::new(policy.clone(), key.clone(), bins.to_vec(), op_type::APPEND);
        execute(&self.cluster, cmd).await
    }

    /// Prepends to string bins.
    pub async fn prepend(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        let cmd = WriteCommand::new(policy.clone(), key.clone(), bins.to_vec(), op_type::PREPEND);
        execute(&self.cluster, cmd).await
    }

    /// Adds to integer bins, creating them at the delta when absent.
    pub async fn add(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        let cmd = WriteCommand::new(policy.clone(), key.clone(), bins.to_vec(), op_type::ADD);
        execute(&self.cluster, cmd).await
    }

    /// Reads a record; `bin_names` restricts the returned bins. Resolves to
    /// `None` when the record does not exist.
    pub async fn get(
        &self,
        policy: &BasePolicy,
        key: &Key,
        bin_names: Option<&[&str]>,
    ) -> Result<Option<Record>> {
        let names = bin_names.map(|names| names.iter().map(|n| n.to_string()).collect());
        let cmd = ReadCommand::new(policy.clone(), key.clone(), names);
        execute(&self.cluster, cmd).await
    }

    /// Reads a record's generation and expiration without its bins.
    pub async fn get_header(&self, policy: &BasePolicy, key: &Key) -> Result<Option<Record>> {
        let cmd = ReadCommand::header(policy.clone(), key.clone());
        execute(&self.cluster, cmd).await
    }

    /// Deletes a record; resolves to whether it existed.
    pub async fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        let cmd = DeleteCommand::new(policy.clone(), key.clone());
        execute(&self.cluster, cmd).await
    }

    /// Resets a record's time-to-live.
    pub async fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        let cmd = TouchCommand::new(policy.clone(), key.clone());
        execute(&self.cluster, cmd).await
    }

    /// Tests whether a record exists.
    pub async fn exists(&self, policy: &BasePolicy, key: &Key) -> Result<bool> {
        let cmd = ExistsCommand::new(policy.clone(), key.clone());
        execute(&self.cluster, cmd).await
    }

    /// Runs an ordered operation list against one record.
    pub async fn operate(
        &self,
        policy: &WritePolicy,
        key: &Key,
        ops: Vec<Operation>,
    ) -> Result<Option<Record>> {
        let cmd = OperateCommand::new(policy.clone(), key.clone(), ops);
        execute(&self.cluster, cmd).await
    }

    /// Applies a registered server-side function to one record.
    pub async fn execute_udf(
        &self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let cmd = ExecuteUdfCommand::new(policy.clone(), key.clone(), package, function, args);
        execute(&self.cluster, cmd).await
    }

    /// Reads many records at once; results arrive in submitted order with
    /// `None` for absent keys.
    pub async fn batch_get(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
        bin_names: Option<&[&str]>,
    ) -> Result<Vec<Option<Record>>> {
        let names = bin_names.map(|names| names.iter().map(|n| n.to_string()).collect());
        batch_get(&self.cluster, policy, keys, names).await
    }

    /// Tests many records at once, in submitted order.
    pub async fn batch_exists(&self, policy: &BatchPolicy, keys: &[Key]) -> Result<Vec<bool>> {
        batch_exists(&self.cluster, policy, keys).await
    }

    /// Streams every record of `(namespace, set)` from all nodes.
    pub fn scan_all(&self, policy: &ScanPolicy, namespace: &str, set_name: &str) -> RecordSet {
        scan_all(
            Arc::clone(&self.cluster),
            policy.clone(),
            namespace.to_string(),
            set_name.to_string(),
            None,
        )
    }

    /// Streams the records matching `statement` from all nodes.
    pub fn query(&self, policy: &QueryPolicy, statement: Statement) -> RecordSet {
        query(Arc::clone(&self.cluster), policy.clone(), statement)
    }

    // Listener-driven variants. Each spawns the command and guarantees the
    // listener exactly one terminal call.

    pub fn get_with_listener(
        &self,
        policy: &BasePolicy,
        key: &Key,
        listener: Box<dyn RecordListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match client.get(&policy, &key, None).await {
                Ok(record) => listener.on_success(key, record),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn put_with_listener(
        &self,
        policy: &WritePolicy,
        key: &Key,
        bins: Vec<Bin>,
        listener: Box<dyn WriteListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match client.put(&policy, &key, &bins).await {
                Ok(()) => listener.on_success(key),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn delete_with_listener(
        &self,
        policy: &WritePolicy,
        key: &Key,
        listener: Box<dyn DeleteListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match client.delete(&policy, &key).await {
                Ok(existed) => listener.on_success(key, existed),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn exists_with_listener(
        &self,
        policy: &BasePolicy,
        key: &Key,
        listener: Box<dyn ExistsListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match client.exists(&policy, &key).await {
                Ok(exists) => listener.on_success(key, exists),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn batch_get_with_listener(
        &self,
        policy: &BatchPolicy,
        keys: Vec<Key>,
        listener: Box<dyn BatchListListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            match client.batch_get(&policy, &keys, None).await {
                Ok(records) => listener.on_success(records),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn batch_exists_with_listener(
        &self,
        policy: &BatchPolicy,
        keys: Vec<Key>,
        listener: Box<dyn ExistsArrayListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            match client.batch_exists(&policy, &keys).await {
                Ok(exists) => listener.on_success(exists),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    pub fn execute_udf_with_listener(
        &self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: Vec<Value>,
        listener: Box<dyn ExecuteListener>,
    ) {
        let client = self.clone();
        let policy = policy.clone();
        let key = key.clone();
        let package = package.to_string();
        let function = function.to_string();
        tokio::spawn(async move {
            match client
                .execute_udf(&policy, &key, &package, &function, args)
                .await
            {
                Ok(result) => listener.on_success(key, result),
                Err(error) => listener.on_failure(error),
            }
        });
    }

    /// Streams a scan through a sequence listener instead of a record set.
    pub fn scan_all_with_listener(
        &self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        mut listener: Box<dyn RecordSequenceListener>,
    ) {
        let mut set = self.scan_all(policy, namespace, set_name);
        tokio::spawn(async move {
            loop {
                match set.next_record().await {
                    Some(Ok((key, record))) => {
                        if let Err(error) = listener.on_record(key, record) {
                            set.close();
                            listener.on_failure(error);
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        listener.on_failure(error);
                        return;
                    }
                    None => {
                        listener.on_success();
                        return;
                    }
                }
            }
        });
    }
}

impl Clone for HiveClient {
    fn clone(&self) -> Self {
        HiveClient {
            cluster: Arc::clone(&self.cluster),
        }
    }
}
