/// Cluster-wide counter alternating reads between master and replica.
#[derive(Debug, Default)]
pub struct ReplicaCounter(AtomicU64);

impl ReplicaCounter {
    /// True on every other call, starting with the first.
    pub fn prefer_master(&self) -> bool {
        self.0.fetch_add(1, Ordering::Relaxed) % 2 == 0
    }
}

impl PartitionTable {
    /// Node serving `partition`.
    ///
    /// Writes only go to an active master. Reads try the preferred copy
    /// first and fall back to the other one; inactive nodes are skipped.
    pub fn get(&self, partition: u32, for_write: bool, prefer_master: bool) -> Option<Arc<Node>> {
        let slot = self.partition(partition)?;
        let active = |node: &Arc<Node>| node.is_active();

        if for_write {
            return slot.master().filter(active);
        }

        let (first, second) = if prefer_master {
            (slot.master(), slot.replica())
        } else {
            (slot.replica(), slot.master())
        };
        first.filter(active).or_else(|| second.filter(active))
    }
}

impl PartitionTables {
    pub fn get(
        &self,
        namespace: &str,
        partition: u32,
        for_write: bool,
        prefer_master: bool,
    ) -> Option<Arc<Node>> {
        self.find(namespace)?
            .get(partition, for_write, prefer_master)
    }
}
