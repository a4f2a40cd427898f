use super::transport::InfoTransport;
use crate::connection::Host;
use crate::core::{DbError, Result};
use crate::protocol::info::{
    INFO_NODE, INFO_PARTITION_GENERATION, INFO_PARTITIONS, INFO_REPLICAS_MASTER,
    INFO_REPLICAS_PROLE, INFO_SERVICES, InfoMap,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A simulated cluster member answering info requests.
#[derive(Debug, Clone)]
struct SimulatedNode {
    name: String,
    generation: u32,
    services: Vec<SocketAddr>,
    masters: BTreeMap<String, Vec<u8>>,
    proles: BTreeMap<String, Vec<u8>>,
    reachable: bool,
}

#[derive(Debug, Default)]
struct SimulatedCluster {
    partitions: u32,
    nodes: HashMap<SocketAddr, SimulatedNode>,
    aliases: HashMap<String, Vec<SocketAddr>>,
    delay: Duration,
    requests: HashMap<SocketAddr, usize>,
}

impl SimulatedCluster {
    fn node_mut(&mut self, addr: SocketAddr) -> Result<&mut SimulatedNode> {
        self.nodes.get_mut(&addr).ok_or_else(|| {
            DbError::InvalidArgument(format!("no simulated node at {}", addr))
        })
    }

    fn bitmap(&self, partitions: &[u32]) -> Vec<u8> {
        let mut bitmap = vec![0u8; (self.partitions as usize).div_ceil(8)];
        for &partition in partitions {
            let index = partition as usize;
            if let Some(byte) = bitmap.get_mut(index >> 3) {
                *byte |= 0x80 >> (index & 7);
            }
        }
        bitmap
    }
}

/// An in-memory implementation of `InfoTransport` for testing.
///
/// Simulates the info endpoints of a cluster: node identity, partition
/// generation, peers and partition ownership. Cloning shares the cluster.
#[derive(Clone, Default)]
pub struct InMemoryInfoTransport {
    cluster: Arc<Mutex<SimulatedCluster>>,
}

impl InMemoryInfoTransport {
    /// Creates an empty simulated cluster with `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        let cluster = SimulatedCluster {
            partitions,
            ..SimulatedCluster::default()
        };
        Self {
            cluster: Arc::new(Mutex::new(cluster)),
        }
    }

    /// Registers a reachable node at `addr` owning nothing yet.
    pub async fn add_node(&self, name: &str, addr: SocketAddr) {
        let mut cluster = self.cluster.lock().await;
        cluster.nodes.insert(
            addr,
            SimulatedNode {
                name: name.to_string(),
                generation: 1,
                services: Vec::new(),
                masters: BTreeMap::new(),
                proles: BTreeMap::new(),
                reachable: true,
            },
        );
    }

    /// Makes a host name resolve to the given addresses.
    pub async fn add_alias(&self, host: &str, addrs: Vec<SocketAddr>) {
        self.cluster
            .lock()
            .await
            .aliases
            .insert(host.to_string(), addrs);
    }

    pub async fn set_reachable(&self, addr: SocketAddr, reachable: bool) -> Result<()> {
        self.cluster.lock().await.node_mut(addr)?.reachable = reachable;
        Ok(())
    }

    /// Delay applied to every request before it is answered.
    pub async fn set_delay(&self, delay: Duration) {
        self.cluster.lock().await.delay = delay;
    }

    pub async fn set_services(&self, addr: SocketAddr, services: Vec<SocketAddr>) -> Result<()> {
        self.cluster.lock().await.node_mut(addr)?.services = services;
        Ok(())
    }

    /// Gives the node the listed master and replica partitions of a
    /// namespace and bumps its partition generation.
    pub async fn assign(
        &self,
        addr: SocketAddr,
        namespace: &str,
        masters: &[u32],
        proles: &[u32],
    ) -> Result<()> {
        let mut cluster = self.cluster.lock().await;
        let master_bitmap = cluster.bitmap(masters);
        let prole_bitmap = cluster.bitmap(proles);
        let node = cluster.node_mut(addr)?;
        node.masters.insert(namespace.to_string(), master_bitmap);
        node.proles.insert(namespace.to_string(), prole_bitmap);
        node.generation += 1;
        Ok(())
    }

    /// Makes the node master of every partition of `namespace`.
    pub async fn assign_all(&self, addr: SocketAddr, namespace: &str) -> Result<()> {
        let partitions = self.cluster.lock().await.partitions;
        let all: Vec<u32> = (0..partitions).collect();
        self.assign(addr, namespace, &all, &[]).await
    }

    /// Drops every partition the node owns and bumps its generation.
    pub async fn clear_ownership(&self, addr: SocketAddr) -> Result<()> {
        let mut cluster = self.cluster.lock().await;
        let empty = cluster.bitmap(&[]);
        let node = cluster.node_mut(addr)?;
        for bitmap in node.masters.values_mut().chain(node.proles.values_mut()) {
            bitmap.clone_from(&empty);
        }
        node.generation += 1;
        Ok(())
    }

    /// Number of info requests the node at `addr` has received.
    pub async fn request_count(&self, addr: SocketAddr) -> usize {
        self.cluster
            .lock()
            .await
            .requests
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    fn encode_replicas(bitmaps: &BTreeMap<String, Vec<u8>>) -> String {
        bitmaps
            .iter()
            .map(|(namespace, bitmap)| format!("{}:{}", namespace, BASE64.encode(bitmap)))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[async_trait]
impl InfoTransport for InMemoryInfoTransport {
    async fn resolve(&self, host: &Host) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.name.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, host.port)]);
        }
        self.cluster
            .lock()
            .await
            .aliases
            .get(&host.name)
            .cloned()
            .ok_or_else(|| DbError::IoError(format!("cannot resolve {}", host)))
    }

    async fn request(&self, addr: SocketAddr, names: &[&str], timeout: Duration) -> Result<InfoMap> {
        let delay = {
            let mut cluster = self.cluster.lock().await;
            *cluster.requests.entry(addr).or_insert(0) += 1;
            cluster.delay
        };
        if delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(DbError::Timeout(format!("info request to {}", addr)));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let cluster = self.cluster.lock().await;
        let node = match cluster.nodes.get(&addr) {
            Some(node) if node.reachable => node,
            _ => {
                return Err(DbError::IoError(format!(
                    "connection to {} refused",
                    addr
                )));
            }
        };

        let mut map = InfoMap::new();
        for name in names {
            let value = match *name {
                INFO_NODE => node.name.clone(),
                INFO_PARTITION_GENERATION => node.generation.to_string(),
                INFO_SERVICES => node
                    .services
                    .iter()
                    .map(SocketAddr::to_string)
                    .collect::<Vec<_>>()
                    .join(";"),
                INFO_PARTITIONS => cluster.partitions.to_string(),
                INFO_REPLICAS_MASTER => Self::encode_replicas(&node.masters),
                INFO_REPLICAS_PROLE => Self::encode_replicas(&node.proles),
                other => {
                    return Err(DbError::Server {
                        code: crate::core::ResultCode::SERVER_ERROR,
                        message: format!("unknown info name {}", other),
                    });
                }
            };
            map.insert(name.to_string(), value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::info::{NodeInfo, PING_NAMES};

    #[tokio::test]
    async fn test_simulated_ping_and_replicas() {
        let transport = InMemoryInfoTransport::new(16);
        let addr: SocketAddr = "10.0.0.1:3000".parse().unwrap();
        transport.add_node("A1", addr).await;
        transport.assign(addr, "test", &[0, 9], &[1]).await.unwrap();

        let map = transport
            .request(addr, &PING_NAMES, Duration::from_secs(1))
            .await
            .unwrap();
        let info = NodeInfo::from_map(&map).unwrap();
        assert_eq!(info.name, "A1");
        assert_eq!(info.partition_generation, 2);

        let map = transport
            .request(addr, &[INFO_REPLICAS_MASTER], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(map[INFO_REPLICAS_MASTER], format!("test:{}", BASE64.encode([0x80u8, 0x40])));
        assert_eq!(transport.request_count(addr).await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_node_refuses() {
        let transport = InMemoryInfoTransport::new(16);
        let addr: SocketAddr = "10.0.0.1:3000".parse().unwrap();
        transport.add_node("A1", addr).await;
        transport.set_reachable(addr, false).await.unwrap();

        assert!(
            transport
                .request(addr, &PING_NAMES, Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
