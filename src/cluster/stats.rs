use crate::connection::PoolStats;
use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one node's health and pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
    pub active: bool,
    pub partition_generation: u32,
    pub intervals_unreachable: u32,
    pub error_count: u32,
    pub commands: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub sync_pool: PoolStats,
    pub async_pool: PoolStats,
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "node {} ({}) gen={} unreachable={} errors={}",
            self.name,
            if self.active { "active" } else { "inactive" },
            self.partition_generation,
            self.intervals_unreachable,
            self.error_count
        )?;
        writeln!(f, "  sync pool:  {}", self.sync_pool)?;
        write!(f, "  async pool: {}", self.async_pool)
    }
}

/// Snapshot of cluster-wide counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStats {
    pub partitions: u32,
    pub namespaces: Vec<String>,
    pub tend_passes: u64,
    pub ping_successes: u64,
    pub ping_failures: u64,
    pub nodes_created: u64,
    pub nodes_removed: u64,
    pub command_successes: u64,
    pub command_failures: u64,
    pub command_timeouts: u64,
    pub command_retries: u64,
    pub nodes: Vec<NodeStats>,
}

impl ClusterStats {
    /// Pretty-printed JSON snapshot for dashboards and diagnostics.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DbError::ParseError(format!("stats serialization: {}", e)))
    }
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cluster: {} node(s), {} partitions, namespaces [{}]",
            self.nodes.len(),
            self.partitions,
            self.namespaces.join(", ")
        )?;
        writeln!(
            f,
            "tend: {} passes, pings {} ok / {} failed, nodes +{} -{}",
            self.tend_passes,
            self.ping_successes,
            self.ping_failures,
            self.nodes_created,
            self.nodes_removed
        )?;
        write!(
            f,
            "commands: {} ok, {} failed, {} timeouts, {} retries",
            self.command_successes, self.command_failures, self.command_timeouts, self.command_retries
        )?;
        for node in &self.nodes {
            write!(f, "\n{}", node)?;
        }
        Ok(())
    }
}

/// Live counters updated by the tend loop and executors.
#[derive(Debug, Default)]
pub struct ClusterCounters {
    pub tend_passes: AtomicU64,
    pub ping_successes: AtomicU64,
    pub ping_failures: AtomicU64,
    pub nodes_created: AtomicU64,
    pub nodes_removed: AtomicU64,
    pub command_successes: AtomicU64,
    pub command_failures: AtomicU64,
    pub command_timeouts: AtomicU64,
    pub command_retries: AtomicU64,
}

impl ClusterCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut ClusterStats) {
        stats.tend_passes = self.tend_passes.load(Ordering::Relaxed);
        stats.ping_successes = self.ping_successes.load(Ordering::Relaxed);
        stats.ping_failures = self.ping_failures.load(Ordering::Relaxed);
        stats.nodes_created = self.nodes_created.load(Ordering::Relaxed);
        stats.nodes_removed = self.nodes_removed.load(Ordering::Relaxed);
        stats.command_successes = self.command_successes.load(Ordering::Relaxed);
        stats.command_failures = self.command_failures.load(Ordering::Relaxed);
        stats.command_timeouts = self.command_timeouts.load(Ordering::Relaxed);
        stats.command_retries = self.command_retries.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_fill_snapshot() {
        let counters = ClusterCounters::default();
        ClusterCounters::bump(&counters.tend_passes);
        ClusterCounters::bump(&counters.tend_passes);
        ClusterCounters::bump(&counters.command_retries);

        let mut stats = ClusterStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.tend_passes, 2);
        assert_eq!(stats.command_retries, 1);
        assert!(stats.to_string().contains("2 passes"));
    }

    #[test]
    fn test_stats_json_round_trip() {
        let stats = ClusterStats {
            partitions: 4096,
            namespaces: vec!["test".to_string()],
            ..ClusterStats::default()
        };
        let json = stats.to_json().unwrap();
        let parsed: ClusterStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.partitions, 4096);
        assert_eq!(parsed.namespaces, vec!["test"]);
    }
}
