use super::stats::NodeStats;
use crate::connection::{
    AsyncConnectionPool, ClientConfig, ConnectionPool, Credentials, PoolStats,
};
use crate::core::{DbError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Longest node name a server may report.
pub const MAX_NODE_NAME_LEN: usize = 20;

/// Partition generation value meaning "unknown, refresh on next ping".
pub const GENERATION_UNKNOWN: u32 = u32::MAX;

/// One cluster member.
///
/// Shared as `Arc<Node>` by the registry, partition slots and in-flight
/// commands. Counters are atomics because tend and command threads touch
/// them concurrently.
pub struct Node {
    name: String,
    addresses: RwLock<Vec<SocketAddr>>,
    active: AtomicBool,
    partition_generation: AtomicU32,
    intervals_absent: AtomicU32,
    intervals_unreachable: AtomicU32,
    error_count: AtomicU32,
    pool: ConnectionPool,
    async_pools: Vec<AsyncConnectionPool>,
    commands: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl Node {
    pub fn new(name: &str, addr: SocketAddr, config: &ClientConfig) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_NODE_NAME_LEN {
            return Err(DbError::InvalidArgument(format!(
                "node name {:?} must be 1..={} bytes",
                name, MAX_NODE_NAME_LEN
            )));
        }

        let per_loop = config.async_conns_per_loop();
        let async_pools = (0..config.event_loops.max(1))
            .map(|index| AsyncConnectionPool::new(index, config.min_conns_per_node, per_loop))
            .collect();

        Ok(Self {
            name: name.to_string(),
            addresses: RwLock::new(vec![addr]),
            active: AtomicBool::new(true),
            partition_generation: AtomicU32::new(GENERATION_UNKNOWN),
            intervals_absent: AtomicU32::new(0),
            intervals_unreachable: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            pool: ConnectionPool::new(config.min_conns_per_node, config.max_conns_per_node),
            async_pools,
            commands: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Logs every new data connection in with `credentials`.
    pub fn with_credentials(mut self, credentials: Option<Arc<Credentials>>) -> Self {
        let pool = std::mem::replace(&mut self.pool, ConnectionPool::new(0, 0));
        self.pool = pool.with_credentials(credentials.clone());
        self.async_pools = std::mem::take(&mut self.async_pools)
            .into_iter()
            .map(|pool| pool.with_credentials(credentials.clone()))
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        match self.addresses.read() {
            Ok(addresses) => addresses.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Address used for data connections.
    pub fn primary_address(&self) -> Result<SocketAddr> {
        self.addresses
            .read()?
            .first()
            .copied()
            .ok_or_else(|| DbError::NoAvailableNode(format!("node {} has no address", self.name)))
    }

    pub fn has_address(&self, addr: &SocketAddr) -> bool {
        self.addresses
            .read()
            .map(|addresses| addresses.contains(addr))
            .unwrap_or(false)
    }

    /// Registers another address for this node; returns false if known.
    pub fn add_address(&self, addr: SocketAddr) -> Result<bool> {
        let mut addresses = self.addresses.write()?;
        if addresses.contains(&addr) {
            return Ok(false);
        }
        addresses.push(addr);
        Ok(true)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the node inactive and closes its idle connections.
    ///
    /// Connections still checked out are closed when their command returns.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let closed = self.pool.close_idle()
                + self.async_pools.iter().map(|pool| pool.close_idle()).sum::<usize>();
            log::debug!("node {} deactivated, closed {} idle connections", self.name, closed);
        }
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub fn set_partition_generation(&self, generation: u32) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    /// Forces a replicas refresh on the next ping.
    pub fn force_partition_refresh(&self) {
        self.partition_generation
            .store(GENERATION_UNKNOWN, Ordering::Release);
    }

    pub fn intervals_absent(&self) -> u32 {
        self.intervals_absent.load(Ordering::Acquire)
    }

    pub(crate) fn increment_absent(&self) -> u32 {
        self.intervals_absent.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_absent(&self) {
        self.intervals_absent.store(0, Ordering::Release);
    }

    pub fn intervals_unreachable(&self) -> u32 {
        self.intervals_unreachable.load(Ordering::Acquire)
    }

    pub(crate) fn increment_unreachable(&self) -> u32 {
        self.intervals_unreachable.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_unreachable(&self) {
        self.intervals_unreachable.store(0, Ordering::Release);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Whether the node's error count in the current window exceeds `max_error_rate`.
    pub fn error_rate_exceeded(&self, max_error_rate: u32) -> bool {
        max_error_rate > 0 && self.error_count() > max_error_rate
    }

    pub(crate) fn reset_error_count(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    pub(crate) fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Synchronous connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Async connection pool owned by event loop `index`.
    pub fn async_pool(&self, index: usize) -> Result<&AsyncConnectionPool> {
        self.async_pools.get(index).ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "event loop {} out of range ({} loops)",
                index,
                self.async_pools.len()
            ))
        })
    }

    pub fn async_pools(&self) -> &[AsyncConnectionPool] {
        &self.async_pools
    }

    /// Applies changed pool limits from a reconfiguration.
    pub fn apply_pool_limits(&self, config: &ClientConfig) {
        self.pool
            .set_limits(config.min_conns_per_node, config.max_conns_per_node);
        let per_loop = config.async_conns_per_loop();
        for pool in &self.async_pools {
            pool.set_limits(config.min_conns_per_node, per_loop);
        }
    }

    pub fn stats(&self) -> NodeStats {
        let mut async_pool = PoolStats::default();
        for pool in &self.async_pools {
            async_pool.merge(&pool.stats());
        }
        NodeStats {
            name: self.name.clone(),
            addresses: self.addresses(),
            active: self.is_active(),
            partition_generation: self.partition_generation(),
            intervals_unreachable: self.intervals_unreachable(),
            error_count: self.error_count(),
            commands: self.commands.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sync_pool: self.pool.stats(),
            async_pool,
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addresses", &self.addresses())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addresses().first() {
            Some(addr) => write!(f, "{} {}", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}
