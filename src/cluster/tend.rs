use super::node::Node;
use super::state::ClusterState;
use super::stats::ClusterCounters;
use crate::connection::{ClientConfig, Host};
use crate::core::{DbError, Result};
use crate::protocol::info::{
    INFO_PARTITION_GENERATION, INFO_PARTITIONS, INFO_REPLICAS_MASTER, INFO_REPLICAS_PROLE,
    NodeInfo, PING_NAMES, REPLICA_NAMES, parse_partition_count, require,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// Absent passes tolerated before a node is removed.
pub const MAX_INTERVALS_ABSENT: u32 = 1;

/// Follow rounds within one pass; bounds discovery chains.
const MAX_FOLLOW_ROUNDS: usize = 8;

/// Outcome of one tend pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TendReport {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub pings_failed: usize,
    pub partitions_refreshed: usize,
}

/// Result of pinging one node.
struct PingOutcome {
    services: Vec<Host>,
    failed: bool,
    refreshed: bool,
}

impl ClusterState {
    /// Runs one tend pass unless another one is in progress.
    pub async fn run_tend_pass(&self) -> Option<TendReport> {
        if self.is_closed() {
            return None;
        }
        let _guard = self.begin_tend()?;
        let config = self.config();
        let mut report = TendReport::default();

        let seeds = self.seeds();
        let mut candidates = Vec::new();
        for seed in &seeds {
            match self.transport.resolve(seed).await {
                Ok(addrs) => candidates.extend(addrs),
                Err(err) => log::warn!("cannot resolve seed {}: {}", seed, err),
            }
        }
        let created = self.discover(candidates, &config).await;
        report.nodes_added += created.len();
        self.ensure_partition_count(&config).await;

        self.evict_absent(&created, &mut report);

        let nodes = self.nodes();
        let mut services = self.ping_all(nodes.iter().cloned().collect(), &config, &mut report).await;

        if config.follow {
            for _ in 0..MAX_FOLLOW_ROUNDS {
                let mut addrs = Vec::new();
                for host in &services {
                    match self.transport.resolve(host).await {
                        Ok(resolved) => addrs.extend(resolved),
                        Err(err) => log::debug!("cannot resolve peer {}: {}", host, err),
                    }
                }
                let fresh = self.discover(addrs, &config).await;
                if fresh.is_empty() {
                    break;
                }
                report.nodes_added += fresh.len();
                self.ensure_partition_count(&config).await;
                services = self.ping_all(fresh, &config, &mut report).await;
            }
        }

        self.set_fully_discovered(report.nodes_added == 0);
        ClusterCounters::bump(&self.counters.tend_passes);
        self.reset_error_window(&config);
        self.maintain_pools(&config);

        if report.nodes_added > 0 || report.nodes_removed > 0 {
            log::info!(
                "tend: +{} -{} nodes, {} ping failure(s), {} refresh(es)",
                report.nodes_added,
                report.nodes_removed,
                report.pings_failed,
                report.partitions_refreshed
            );
        }
        Some(report)
    }

    /// Pings addresses not owned by a known node and registers what answers.
    /// Returns the nodes created.
    async fn discover(&self, addrs: Vec<SocketAddr>, config: &ClientConfig) -> Vec<Arc<Node>> {
        let mut seen = HashSet::new();
        let unknown: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|addr| seen.insert(*addr) && self.find_node_by_address(addr).is_none())
            .collect();
        if unknown.is_empty() {
            return Vec::new();
        }

        let replies = join_all(unknown.iter().map(|addr| async move {
            let reply = self
                .transport
                .request(*addr, &PING_NAMES, config.info_timeout)
                .await
                .and_then(|map| NodeInfo::from_map(&map));
            (*addr, reply)
        }))
        .await;

        let mut created: Vec<Arc<Node>> = Vec::new();
        for (addr, reply) in replies {
            let info = match reply {
                Ok(info) => info,
                Err(err) => {
                    log::info!("no node at {}: {}", addr, err);
                    continue;
                }
            };

            if let Some(node) = self.find_node(&info.name) {
                if let Err(err) = node.add_address(addr) {
                    log::warn!("cannot record address {} for {}: {}", addr, node.name(), err);
                }
                continue;
            }
            if let Some(node) = created.iter().find(|node| node.name() == info.name) {
                if let Err(err) = node.add_address(addr) {
                    log::warn!("cannot record address {} for {}: {}", addr, node.name(), err);
                }
                continue;
            }

            match Node::new(&info.name, addr, config) {
                Ok(node) => created.push(Arc::new(node.with_credentials(self.credentials()))),
                Err(err) => log::warn!("rejecting node at {}: {}", addr, err),
            }
        }

        self.add_nodes(&created);
        created
    }

    /// Reads the partition count from the first known address that answers.
    /// Runs every pass until the count is known.
    async fn ensure_partition_count(&self, config: &ClientConfig) {
        if self.partition_count().is_some() {
            return;
        }
        for node in self.nodes().iter() {
            for addr in node.addresses() {
                match self.fetch_partition_count(addr, config).await {
                    Ok(()) => return,
                    Err(err) => {
                        log::warn!("cannot read partition count from {}: {}", addr, err)
                    }
                }
            }
        }
    }

    async fn fetch_partition_count(&self, addr: SocketAddr, config: &ClientConfig) -> Result<()> {
        let map = self
            .transport
            .request(addr, &[INFO_PARTITIONS], config.info_timeout)
            .await?;
        let count = parse_partition_count(&map)?;
        if self.set_partition_count(count) {
            log::info!("cluster has {} partitions", count);
        }
        Ok(())
    }

    /// Removes nodes that have owned no partition for too many passes.
    ///
    /// Nodes created in this pass have not loaded their partitions yet and
    /// are not counted.
    fn evict_absent(&self, created: &[Arc<Node>], report: &mut TendReport) {
        let tables = self.tables();
        let mut evicted = Vec::new();
        for node in self.nodes().iter() {
            if created.iter().any(|fresh| Arc::ptr_eq(fresh, node)) {
                continue;
            }
            if tables.contains_node(node) {
                node.reset_absent();
            } else if node.increment_absent() > MAX_INTERVALS_ABSENT {
                evicted.push(Arc::clone(node));
            }
        }
        report.nodes_removed += evicted.len();
        self.remove_nodes(&evicted);
    }

    /// Pings nodes concurrently; returns the peers they advertise.
    async fn ping_all(
        &self,
        nodes: Vec<Arc<Node>>,
        config: &ClientConfig,
        report: &mut TendReport,
    ) -> Vec<Host> {
        let outcomes = join_all(nodes.iter().map(|node| self.ping(node, config))).await;

        let mut services = Vec::new();
        for outcome in outcomes {
            if outcome.failed {
                report.pings_failed += 1;
            }
            if outcome.refreshed {
                report.partitions_refreshed += 1;
            }
            for host in outcome.services {
                if !services.contains(&host) {
                    services.push(host);
                }
            }
        }
        services
    }

    async fn ping(&self, node: &Arc<Node>, config: &ClientConfig) -> PingOutcome {
        let mut last_error = None;
        let mut info = None;
        for addr in node.addresses() {
            let reply = self
                .transport
                .request(addr, &PING_NAMES, config.info_timeout)
                .await
                .and_then(|map| NodeInfo::from_map(&map))
                .and_then(|reply| {
                    if reply.name == node.name() {
                        Ok(reply)
                    } else {
                        Err(DbError::Protocol(format!(
                            "address {} now answers as node {}",
                            addr, reply.name
                        )))
                    }
                });
            match reply {
                Ok(reply) => {
                    info = Some((addr, reply));
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }

        let Some((addr, info)) = info else {
            let unreachable = node.increment_unreachable();
            ClusterCounters::bump(&self.counters.ping_failures);
            if let Some(err) = last_error {
                log::info!(
                    "node {} unreachable ({} pass(es)): {}",
                    node.name(),
                    unreachable,
                    err
                );
            }
            return PingOutcome {
                services: Vec::new(),
                failed: true,
                refreshed: false,
            };
        };

        node.reset_unreachable();
        ClusterCounters::bump(&self.counters.ping_successes);

        let mut refreshed = false;
        if info.partition_generation != node.partition_generation() && self.partition_count().is_some() {
            match self.refresh_partitions(node, addr, config).await {
                Ok(()) => refreshed = true,
                Err(err) => log::warn!("partition refresh of {} failed: {}", node.name(), err),
            }
        }

        PingOutcome {
            services: info.services,
            failed: false,
            refreshed,
        }
    }

    /// Reloads the node's master and replica ownership.
    ///
    /// The node's generation is only advanced once the reply was applied, so
    /// a failed refresh is retried on the next pass.
    async fn refresh_partitions(
        &self,
        node: &Arc<Node>,
        addr: SocketAddr,
        config: &ClientConfig,
    ) -> Result<()> {
        let map = self
            .transport
            .request(addr, &REPLICA_NAMES, config.info_timeout)
            .await?;
        let raw = require(&map, INFO_PARTITION_GENERATION)?.trim();
        let generation = raw
            .parse::<u32>()
            .map_err(|_| DbError::ParseError(format!("invalid partition generation {:?}", raw)))?;

        let summary = self.apply_replicas(
            node,
            require(&map, INFO_REPLICAS_MASTER)?,
            require(&map, INFO_REPLICAS_PROLE)?,
        )?;
        node.set_partition_generation(generation);
        log::debug!(
            "node {} generation {}: {} slot(s) installed, {} cleared",
            node.name(),
            generation,
            summary.installed,
            summary.cleared
        );
        Ok(())
    }

    fn reset_error_window(&self, config: &ClientConfig) {
        if config.max_error_rate == 0 || config.error_rate_window == 0 {
            return;
        }
        let passes = self
            .counters
            .tend_passes
            .load(std::sync::atomic::Ordering::Relaxed);
        if passes % config.error_rate_window as u64 == 0 {
            for node in self.nodes().iter() {
                node.reset_error_count();
            }
        }
    }

    /// Trims idle connections and tops pools up to their minimum size.
    ///
    /// Blocking pools are handled on the blocking thread pool and async pools
    /// on their own event loop; the pass does not wait for either.
    fn maintain_pools(&self, config: &ClientConfig) {
        let idle = config.max_socket_idle;
        let connect_timeout = config.connect_timeout;

        for node in self.nodes().iter() {
            let Ok(addr) = node.primary_address() else {
                continue;
            };

            let sync_node = Arc::clone(node);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = sync_node.pool().trim(idle, addr, connect_timeout) {
                    log::debug!("pool maintenance for {} failed: {}", sync_node.name(), err);
                }
            });

            for index in 0..self.event_loops.len() {
                let loop_node = Arc::clone(node);
                let spawned = self.event_loops.spawn_on(index, async move {
                    let Ok(pool) = loop_node.async_pool(index) else {
                        return;
                    };
                    if let Err(err) = pool.trim(idle) {
                        log::debug!("async trim for {} failed: {}", loop_node.name(), err);
                    }
                    if let Err(err) = pool.fill(addr, connect_timeout).await {
                        log::debug!("async fill for {} failed: {}", loop_node.name(), err);
                    }
                });
                if let Err(err) = spawned {
                    log::debug!("cannot schedule pool maintenance: {}", err);
                }
            }
        }
    }
}
