use super::node::Node;
use super::partition::DIGEST_SIZE;
use super::scheduler::TendScheduler;
use super::state::ClusterState;
use super::stats::ClusterStats;
use super::tend::TendReport;
use super::transport::{InfoTransport, TcpInfoTransport};
use crate::command::event_loop::EventLoopGroup;
use crate::connection::{ClientConfig, Credentials, Host, RuntimeOptions};
use crate::core::{DbError, Result};
use crate::protocol::InfoMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Tend passes run at creation while they keep discovering nodes.
const INITIAL_TEND_PASSES: usize = 5;

/// Sleep between checks while waiting for a new seed to show up.
const SEED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client handle to one cluster.
///
/// Owns the shared [`ClusterState`] and the tend scheduler. Cheap operations
/// (node lookup, statistics) never block; `destroy` waits for the tend task.
pub struct Cluster {
    pub(crate) state: Arc<ClusterState>,
    scheduler: Mutex<Option<TendScheduler>>,
}

impl Cluster {
    /// Connects to the cluster described by `config` over TCP.
    pub async fn create(config: ClientConfig) -> Result<Self> {
        config.validate().map_err(DbError::InvalidConfig)?;
        let credentials = Self::hash_credentials(&config).await?;
        let transport = TcpInfoTransport::with_credentials(credentials.clone());
        Self::start(config, Arc::new(transport), credentials).await
    }

    /// Connects using a custom info transport.
    ///
    /// Runs the first tend passes before returning; fails with
    /// `NoAvailableNode` when nothing answered and `fail_if_not_connected`
    /// is set.
    pub async fn create_with_transport(
        config: ClientConfig,
        transport: Arc<dyn InfoTransport>,
    ) -> Result<Self> {
        config.validate().map_err(DbError::InvalidConfig)?;
        let credentials = Self::hash_credentials(&config).await?;
        Self::start(config, transport, credentials).await
    }

    /// Password hashing is slow enough to keep off the runtime threads.
    async fn hash_credentials(config: &ClientConfig) -> Result<Option<Arc<Credentials>>> {
        let config = config.clone();
        let credentials = tokio::task::spawn_blocking(move || Credentials::from_config(&config))
            .await
            .map_err(|e| DbError::Fatal(format!("credential hashing failed: {}", e)))??;
        Ok(credentials.map(Arc::new))
    }

    async fn start(
        config: ClientConfig,
        transport: Arc<dyn InfoTransport>,
        credentials: Option<Arc<Credentials>>,
    ) -> Result<Self> {
        let event_loops = EventLoopGroup::start(config.event_loops)?;
        let state = Arc::new(
            ClusterState::new(config.clone(), transport, event_loops).with_credentials(credentials),
        );

        for _ in 0..INITIAL_TEND_PASSES {
            match state.run_tend_pass().await {
                Some(report) if report.nodes_added > 0 => continue,
                _ => break,
            }
        }

        if state.nodes().is_empty() {
            if config.fail_if_not_connected {
                state.shutdown();
                Self::join_event_loops(&state).await;
                return Err(DbError::NoAvailableNode(format!(
                    "no node reachable through seeds {}",
                    config
                        .seeds
                        .iter()
                        .map(Host::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            log::warn!("cluster created without any reachable node");
        }

        let scheduler = TendScheduler::start(Arc::clone(&state));
        Ok(Self {
            state,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    /// Adds a seed and waits until a node reachable through it is known.
    ///
    /// Adding the same host twice leaves the seed list unchanged.
    pub async fn add_seed_host(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let seed = Host::new(host, port);
        self.state.add_seed(seed.clone())?;

        let deadline = Instant::now() + timeout;
        let addrs = match tokio::time::timeout(timeout, self.state.transport.resolve(&seed)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(err)) => {
                return Err(DbError::NoAvailableNode(format!("seed {}: {}", seed, err)));
            }
            Err(_) => {
                return Err(DbError::NoAvailableNode(format!(
                    "seed {} did not resolve within {:?}",
                    seed, timeout
                )));
            }
        };

        let mut pass = Some(self.spawn_tend());
        loop {
            let known = self
                .state
                .nodes()
                .iter()
                .any(|node| addrs.iter().any(|addr| node.has_address(addr)));
            if known {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DbError::NoAvailableNode(format!(
                    "no node reachable through seed {} within {:?}",
                    seed, timeout
                )));
            }

            // A pass already in flight may have read the seed list before
            // this seed was added; run another one once it is done.
            if let Some(handle) = pass.take_if(|handle| handle.is_finished())
                && !handle.await.unwrap_or(false)
            {
                pass = Some(self.spawn_tend());
            }

            tokio::time::sleep(SEED_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn spawn_tend(&self) -> tokio::task::JoinHandle<bool> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move { state.run_tend_pass().await.is_some() })
    }

    /// Runs one tend pass now. Returns false if a pass was already running.
    pub async fn tend_once(&self) -> bool {
        self.state.run_tend_pass().await.is_some()
    }

    /// Like `tend_once`, returning what the pass changed.
    pub async fn tend_report(&self) -> Option<TendReport> {
        self.state.run_tend_pass().await
    }

    pub fn node_for_key(
        &self,
        namespace: &str,
        digest: &[u8; DIGEST_SIZE],
        for_write: bool,
    ) -> Result<Arc<Node>> {
        self.state.node_for_key(namespace, digest, for_write)
    }

    pub fn random_node(&self) -> Result<Arc<Node>> {
        self.state.random_node()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.state.nodes().iter().cloned().collect()
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.state.find_node(name)
    }

    pub fn seeds(&self) -> Vec<Host> {
        self.state.seeds()
    }

    pub fn config(&self) -> ClientConfig {
        self.state.config()
    }

    pub fn partition_count(&self) -> Option<u32> {
        self.state.partition_count()
    }

    pub fn is_fully_discovered(&self) -> bool {
        self.state.is_fully_discovered()
    }

    pub fn peak_concurrent_passes(&self) -> usize {
        self.state.peak_concurrent_passes()
    }

    pub fn event_loop_count(&self) -> usize {
        self.state.event_loops.len()
    }

    /// Sends an info request to one node.
    pub async fn info(&self, node: &Node, names: &[&str]) -> Result<InfoMap> {
        let addr = node.primary_address()?;
        let timeout = self.state.config().info_timeout;
        self.state.transport.request(addr, names, timeout).await
    }

    pub fn reconfigure(&self, options: &RuntimeOptions) -> Result<()> {
        self.state.reconfigure(options)
    }

    pub fn stats(&self) -> ClusterStats {
        self.state.stats()
    }

    /// Stops the tend task, releases every node and stops the event loops.
    pub async fn destroy(&self) -> Result<()> {
        let scheduler = self.scheduler.lock()?.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await?;
        }
        self.state.shutdown();
        Self::join_event_loops(&self.state).await;
        Ok(())
    }

    async fn join_event_loops(state: &Arc<ClusterState>) {
        let state = Arc::clone(state);
        if let Err(err) = tokio::task::spawn_blocking(move || state.event_loops.shutdown()).await {
            log::warn!("event loop shutdown failed: {}", err);
        }
    }
}
