use super::node::Node;
use crate::core::{DbError, Result};
use arc_swap::ArcSwapOption;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One partition slot: current master and replica, each optional.
///
/// Slots are swapped atomically so lookups never block the tend task.
#[derive(Default)]
pub struct Partition {
    master: ArcSwapOption<Node>,
    replica: ArcSwapOption<Node>,
}

/// Partition map of one namespace. Its length is the cluster partition count.
pub struct PartitionTable {
    namespace: String,
    partitions: Box<[Partition]>,
}

/// Immutable set of namespace tables, replaced wholesale when a namespace appears.
#[derive(Clone, Default)]
pub struct PartitionTables {
    tables: Vec<Arc<PartitionTable>>,
}

// Partition handling is split by concern: hashing, table construction,
// replica updates and node lookups.
include!("partition/hash.rs");
include!("partition/table.rs");
include!("partition/update.rs");
include!("partition/lookups.rs");
