// ============================================================================
// rustkvclient: cluster topology and command dispatch for a partitioned
// key-value store
// ============================================================================

pub mod cluster;
pub mod command;
pub mod connection;
pub mod core;
pub mod protocol;

// Re-export main types for convenience
pub use cluster::{Cluster, ClusterStats, DIGEST_SIZE, InMemoryInfoTransport, Node, NodeStats};
pub use command::{
    BatchRequest, CommandOutcome, CommandTarget, HandlerAction, RecordStream, Response,
    ResponseHandler,
};
pub use connection::{ClientConfig, CommandPolicy, Credentials, Host, Replica, RuntimeOptions};
pub use core::{DbError, ErrorKind, Result, ResultCode};

use std::sync::Arc;

// ============================================================================
// High-level Client API
// ============================================================================

/// Cluster client with a default command policy.
///
/// This is the recommended entry point: it owns one [`Cluster`] and sends
/// commands with the policy derived from the configuration.
///
/// # Examples
///
/// ```no_run
/// use rustkvclient::{Client, CommandTarget};
///
/// # async fn run() -> rustkvclient::Result<()> {
/// let client = Client::connect("127.0.0.1", 3000).await?;
///
/// let digest = [7u8; rustkvclient::DIGEST_SIZE];
/// let response = client
///     .execute(CommandTarget::read("test", digest), b"encoded request")
///     .await?;
/// println!("result code {}", response.result_code());
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    cluster: Arc<Cluster>,
    policy: CommandPolicy,
}

impl Client {
    /// Connect through a single seed host with default configuration.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_config(ClientConfig::new(host, port)).await
    }

    /// Connect with custom configuration
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use rustkvclient::{Client, ClientConfig};
    /// # use std::time::Duration;
    /// # async fn run() -> rustkvclient::Result<()> {
    /// let config = ClientConfig::new("10.0.0.1", 3000)
    ///     .seed("10.0.0.2", 3000)
    ///     .max_retries(4)
    ///     .tend_interval(Duration::from_millis(500));
    ///
    /// let client = Client::connect_with_config(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let policy = CommandPolicy::from_config(&config);
        let cluster = Cluster::create(config).await?;
        Ok(Self {
            cluster: Arc::new(cluster),
            policy,
        })
    }

    /// Connect using a connection string
    ///
    /// Format: `kvdb://[user:password@]host[:port][,host[:port]...]`
    pub async fn connect_url(url: &str) -> Result<Self> {
        let config = ClientConfig::from_url(url).map_err(DbError::ParseError)?;
        Self::connect_with_config(config).await
    }

    /// Wraps an existing cluster handle.
    pub fn from_cluster(cluster: Arc<Cluster>) -> Self {
        let policy = CommandPolicy::from_config(&cluster.config());
        Self { cluster, policy }
    }

    /// Replaces the default command policy.
    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Run a command on an event loop and await its response.
    pub async fn execute(&self, target: CommandTarget, request: &[u8]) -> Result<Response> {
        self.cluster.execute(target, request, &self.policy).await
    }

    /// Run a command on the calling thread.
    ///
    /// Blocks; call it from a plain thread or `spawn_blocking`.
    pub fn execute_sync(&self, target: CommandTarget, request: &[u8]) -> Result<Response> {
        self.cluster.execute_sync(target, request, &self.policy)
    }

    /// Run several commands at once, one result per request.
    pub async fn execute_batch(&self, requests: Vec<BatchRequest>) -> Vec<Result<Response>> {
        self.cluster.execute_batch(requests, &self.policy).await
    }

    /// Node currently owning the key's partition.
    pub fn node_for_key(
        &self,
        namespace: &str,
        digest: &[u8; DIGEST_SIZE],
        for_write: bool,
    ) -> Result<Arc<Node>> {
        self.cluster.node_for_key(namespace, digest, for_write)
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        self.cluster.stats()
    }

    /// Stop tending and release every node.
    pub async fn close(&self) -> Result<()> {
        self.cluster.destroy().await
    }
}
