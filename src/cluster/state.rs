use super::node::Node;
use super::partition::{
    DIGEST_SIZE, PartitionTables, ReplicaCounter, UpdateSummary, parse_replicas, partition_of,
};
use super::stats::{ClusterCounters, ClusterStats};
use super::transport::InfoTransport;
use crate::command::event_loop::EventLoopGroup;
use crate::connection::{ClientConfig, Credentials, Host, Replica, RuntimeOptions};
use crate::core::{DbError, Result};
use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Shared topology of one cluster.
///
/// The node list and partition table set are immutable snapshots swapped
/// atomically by the tend task; readers never take a lock.
pub struct ClusterState {
    config: RwLock<ClientConfig>,
    seeds: Mutex<Vec<Host>>,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    tables: ArcSwap<PartitionTables>,
    /// Zero until the first node reported its partition count.
    partition_count: AtomicU32,
    replica_counter: ReplicaCounter,
    tend_active: AtomicBool,
    active_passes: AtomicUsize,
    peak_passes: AtomicUsize,
    fully_discovered: AtomicBool,
    closed: AtomicBool,
    credentials: Option<Arc<Credentials>>,
    pub(crate) transport: Arc<dyn InfoTransport>,
    pub(crate) event_loops: EventLoopGroup,
    pub(crate) counters: ClusterCounters,
}

impl ClusterState {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn InfoTransport>,
        event_loops: EventLoopGroup,
    ) -> Self {
        let seeds = config.seeds.clone();
        Self {
            config: RwLock::new(config),
            seeds: Mutex::new(seeds),
            nodes: ArcSwap::from_pointee(Vec::new()),
            tables: ArcSwap::from_pointee(PartitionTables::default()),
            partition_count: AtomicU32::new(0),
            replica_counter: ReplicaCounter::default(),
            tend_active: AtomicBool::new(false),
            active_passes: AtomicUsize::new(0),
            peak_passes: AtomicUsize::new(0),
            fully_discovered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            credentials: None,
            transport,
            event_loops,
            counters: ClusterCounters::default(),
        }
    }

    /// Credentials every node's data connections log in with.
    pub fn with_credentials(mut self, credentials: Option<Arc<Credentials>>) -> Self {
        self.credentials = credentials;
        self
    }

    pub(crate) fn credentials(&self) -> Option<Arc<Credentials>> {
        self.credentials.clone()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> ClientConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn seeds(&self) -> Vec<Host> {
        match self.seeds.lock() {
            Ok(seeds) => seeds.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Appends a seed unless already present; returns whether it was added.
    pub fn add_seed(&self, host: Host) -> Result<bool> {
        let mut seeds = self.seeds.lock()?;
        if seeds.contains(&host) {
            return Ok(false);
        }
        log::info!("adding seed {}", host);
        seeds.push(host);
        Ok(true)
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    pub fn tables(&self) -> Arc<PartitionTables> {
        self.tables.load_full()
    }

    pub fn partition_count(&self) -> Option<u32> {
        match self.partition_count.load(Ordering::Acquire) {
            0 => None,
            count => Some(count),
        }
    }

    pub(crate) fn set_partition_count(&self, count: u32) -> bool {
        self.partition_count
            .compare_exchange(0, count, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fully_discovered(&self) -> bool {
        self.fully_discovered.load(Ordering::Acquire)
    }

    pub(crate) fn set_fully_discovered(&self, value: bool) {
        self.fully_discovered.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .find(|node| node.name() == name)
            .cloned()
    }

    pub fn find_node_by_address(&self, addr: &SocketAddr) -> Option<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .find(|node| node.has_address(addr))
            .cloned()
    }

    /// Publishes a node list with `added` appended.
    pub(crate) fn add_nodes(&self, added: &[Arc<Node>]) {
        if added.is_empty() {
            return;
        }
        // A pass still running when the cluster closed must not repopulate it.
        if self.is_closed() {
            for node in added {
                node.deactivate();
            }
            return;
        }
        let current = self.nodes.load_full();
        let mut next = Vec::with_capacity(current.len() + added.len());
        next.extend(current.iter().cloned());
        next.extend(added.iter().cloned());
        self.nodes.store(Arc::new(next));
        for node in added {
            ClusterCounters::bump(&self.counters.nodes_created);
            log::info!("added node {}", node);
        }
    }

    /// Publishes a node list without `removed` and deactivates them.
    pub(crate) fn remove_nodes(&self, removed: &[Arc<Node>]) {
        if removed.is_empty() {
            return;
        }
        let current = self.nodes.load_full();
        let next: Vec<Arc<Node>> = current
            .iter()
            .filter(|node| !removed.iter().any(|gone| Arc::ptr_eq(gone, node)))
            .cloned()
            .collect();
        self.nodes.store(Arc::new(next));
        for node in removed {
            node.deactivate();
            ClusterCounters::bump(&self.counters.nodes_removed);
            log::info!("removed node {}", node);
        }
    }

    /// Validates both replica replies, then patches the tables for `node`.
    ///
    /// Nothing is applied when either reply is malformed.
    pub(crate) fn apply_replicas(
        &self,
        node: &Arc<Node>,
        masters: &str,
        proles: &str,
    ) -> Result<UpdateSummary> {
        let count = self.partition_count().ok_or_else(|| {
            DbError::Protocol("partition count not known yet".to_string())
        })?;
        let masters = parse_replicas(masters, count)?;
        let proles = parse_replicas(proles, count)?;

        if self.is_closed() {
            return Ok(UpdateSummary::default());
        }
        let current = self.tables.load_full();
        let (next, summary) = current.apply(node, &masters, &proles, count)?;
        if let Some(next) = next {
            self.tables.store(Arc::new(next));
        }
        Ok(summary)
    }

    /// Read preference for the first attempt of a command: the shared
    /// alternation counter under `Any`, the master otherwise.
    pub fn read_preference(&self, replica: Replica) -> bool {
        match replica {
            Replica::Any => self.replica_counter.prefer_master(),
            Replica::Master | Replica::Sequence => true,
        }
    }

    /// Node owning `partition` of `namespace`.
    ///
    /// `use_master` is the command's current read preference; `Master`
    /// ignores it. Falls back to a random active node when the slot is
    /// empty or inactive.
    pub fn node_for_partition(
        &self,
        namespace: &str,
        partition: u32,
        for_write: bool,
        replica: Replica,
        use_master: bool,
    ) -> Result<Arc<Node>> {
        let master_only = self.config.read().map(|c| c.read_master_only).unwrap_or(false);
        let for_write = for_write || master_only;
        let prefer_master = match replica {
            Replica::Master => true,
            Replica::Any | Replica::Sequence => use_master,
        };

        match self
            .tables
            .load()
            .get(namespace, partition, for_write, prefer_master)
        {
            Some(node) => Ok(node),
            None => self.random_node(),
        }
    }

    pub fn node_for_key(
        &self,
        namespace: &str,
        digest: &[u8; DIGEST_SIZE],
        for_write: bool,
    ) -> Result<Arc<Node>> {
        let partition = partition_of(digest, self.partition_count().unwrap_or(0));
        let prefer_master = self.read_preference(Replica::Any);
        self.node_for_partition(namespace, partition, for_write, Replica::Any, prefer_master)
    }

    /// Any active node.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.load();
        let active: Vec<&Arc<Node>> = nodes.iter().filter(|node| node.is_active()).collect();
        active
            .choose(&mut rand::thread_rng())
            .map(|node| Arc::clone(node))
            .ok_or_else(|| DbError::NoAvailableNode("cluster has no active node".to_string()))
    }

    /// Validates and applies runtime options, then pushes pool limits to nodes.
    pub fn reconfigure(&self, options: &RuntimeOptions) -> Result<()> {
        let next = {
            let mut config = self.config.write()?;
            let next = config
                .with_runtime_options(options)
                .map_err(DbError::InvalidConfig)?;
            *config = next.clone();
            next
        };
        for node in self.nodes.load().iter() {
            node.apply_pool_limits(&next);
        }
        log::info!("cluster reconfigured");
        Ok(())
    }

    /// Marks the start of a tend pass; `None` if one is already running.
    pub(crate) fn begin_tend(&self) -> Option<TendGuard<'_>> {
        if self
            .tend_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let running = self.active_passes.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_passes.fetch_max(running, Ordering::AcqRel);
        Some(TendGuard { state: self })
    }

    /// Highest number of tend passes ever observed running at once.
    pub fn peak_concurrent_passes(&self) -> usize {
        self.peak_passes.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClusterStats {
        let mut stats = ClusterStats {
            partitions: self.partition_count().unwrap_or(0),
            namespaces: self.tables.load().namespaces(),
            nodes: self.nodes.load().iter().map(|node| node.stats()).collect(),
            ..ClusterStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    /// Releases every node and table. The tend task must already be stopped.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let nodes = self.nodes.swap(Arc::new(Vec::new()));
        self.tables.store(Arc::new(PartitionTables::default()));
        for node in nodes.iter() {
            node.deactivate();
        }
        log::info!("cluster closed, released {} node(s)", nodes.len());
    }
}

/// Held for the duration of one tend pass.
pub(crate) struct TendGuard<'a> {
    state: &'a ClusterState,
}

impl Drop for TendGuard<'_> {
    fn drop(&mut self) {
        self.state.active_passes.fetch_sub(1, Ordering::AcqRel);
        self.state.tend_active.store(false, Ordering::Release);
    }
}
