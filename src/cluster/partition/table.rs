impl Partition {
    pub fn master(&self) -> Option<Arc<Node>> {
        self.master.load_full()
    }

    pub fn replica(&self) -> Option<Arc<Node>> {
        self.replica.load_full()
    }

    fn slot(&self, is_master: bool) -> &ArcSwapOption<Node> {
        if is_master { &self.master } else { &self.replica }
    }

    fn holds(&self, node: &Arc<Node>) -> bool {
        slot_is(&self.master, node) || slot_is(&self.replica, node)
    }
}

impl PartitionTable {
    /// Creates an empty table with one slot per partition.
    pub fn new(namespace: &str, partition_count: u32) -> Result<Self> {
        validate_namespace(namespace)?;
        let partitions = (0..partition_count)
            .map(|_| Partition::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            namespace: namespace.to_string(),
            partitions,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partition(&self, index: u32) -> Option<&Partition> {
        self.partitions.get(index as usize)
    }

    /// Whether the node holds any master or replica slot.
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.partitions.iter().any(|partition| partition.holds(node))
    }

    /// Re-derives the ownership bitmap of a node from the slots.
    pub fn ownership_bitmap(&self, node: &Arc<Node>, is_master: bool) -> Vec<u8> {
        let mut bitmap = vec![0u8; self.partitions.len().div_ceil(8)];
        for (index, partition) in self.partitions.iter().enumerate() {
            if slot_is(partition.slot(is_master), node) {
                bitmap[index >> 3] |= 0x80 >> (index & 7);
            }
        }
        bitmap
    }
}

impl PartitionTables {
    pub fn find(&self, namespace: &str) -> Option<&Arc<PartitionTable>> {
        self.tables.iter().find(|table| table.namespace == namespace)
    }

    /// Copy of this set with `table` appended.
    pub fn with_added(&self, table: Arc<PartitionTable>) -> Self {
        let mut tables = Vec::with_capacity(self.tables.len() + 1);
        tables.extend(self.tables.iter().cloned());
        tables.push(table);
        Self { tables }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|table| table.namespace.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Whether any table references the node.
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.tables.iter().any(|table| table.contains_node(node))
    }
}

fn slot_is(slot: &ArcSwapOption<Node>, node: &Arc<Node>) -> bool {
    match &*slot.load() {
        Some(current) => Arc::ptr_eq(current, node),
        None => false,
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(DbError::ParseError(format!(
            "namespace {:?} must be 1..={} bytes",
            namespace, MAX_NAMESPACE_LEN
        )));
    }
    Ok(())
}

/// Longest namespace name accepted in a replicas reply.
pub const MAX_NAMESPACE_LEN: usize = 31;
