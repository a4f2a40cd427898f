//! Cluster topology: nodes, partition ownership and the tend loop that
//! keeps both current.

pub mod handle;
pub mod in_memory_transport;
pub mod node;
pub mod partition;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod tend;
pub mod transport;

pub use handle::Cluster;
pub use in_memory_transport::InMemoryInfoTransport;
pub use node::{MAX_NODE_NAME_LEN, Node};
pub use partition::{DIGEST_SIZE, PartitionTable, PartitionTables, partition_of};
pub use scheduler::TendScheduler;
pub use state::ClusterState;
pub use stats::{ClusterStats, NodeStats};
pub use tend::{MAX_INTERVALS_ABSENT, TendReport};
pub use transport::{InfoTransport, TcpInfoTransport};
