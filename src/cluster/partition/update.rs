/// One namespace's ownership bitmap from a `replicas-master` or
/// `replicas-prole` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaBitmap {
    pub namespace: String,
    pub bitmap: Vec<u8>,
}

/// Slots changed by applying bitmaps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub installed: usize,
    pub cleared: usize,
    pub namespaces_added: usize,
}

/// Parses `ns:base64;ns:base64`.
///
/// Every entry is validated before anything is returned, so a malformed
/// entry rejects the whole reply.
pub fn parse_replicas(value: &str, partition_count: u32) -> Result<Vec<ReplicaBitmap>> {
    let expected_text = bitmap_base64_len(partition_count);
    let expected_bytes = bitmap_len(partition_count);
    let mut parsed = Vec::new();

    for entry in value.trim().split(';').filter(|entry| !entry.is_empty()) {
        let (namespace, encoded) = entry.split_once(':').ok_or_else(|| {
            DbError::ParseError(format!("replicas entry {:?} lacks ':'", entry))
        })?;
        validate_namespace(namespace)?;
        if encoded.len() != expected_text {
            return Err(DbError::ParseError(format!(
                "bitmap of namespace {} is {} chars, expected {}",
                namespace,
                encoded.len(),
                expected_text
            )));
        }
        let bitmap = BASE64.decode(encoded).map_err(|e| {
            DbError::ParseError(format!("bitmap of namespace {}: {}", namespace, e))
        })?;
        if bitmap.len() != expected_bytes {
            return Err(DbError::ParseError(format!(
                "bitmap of namespace {} decodes to {} bytes, expected {}",
                namespace,
                bitmap.len(),
                expected_bytes
            )));
        }
        parsed.push(ReplicaBitmap {
            namespace: namespace.to_string(),
            bitmap,
        });
    }

    Ok(parsed)
}

impl PartitionTable {
    /// Diffs the node's slots against its new bitmap and patches them.
    ///
    /// Slots the node lost are cleared. Slots it gained get the node; a node
    /// displaced from such a slot is marked for a partition refresh.
    pub fn update(&self, node: &Arc<Node>, bitmap: &[u8], is_master: bool) -> UpdateSummary {
        let mut summary = UpdateSummary::default();

        for (index, partition) in self.partitions.iter().enumerate() {
            let slot = partition.slot(is_master);
            let current = slot.load_full();
            let holds = current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, node));

            if bitmap_contains(bitmap, index) {
                if holds {
                    continue;
                }
                slot.store(Some(Arc::clone(node)));
                summary.installed += 1;
                if let Some(previous) = current {
                    log::debug!(
                        "{} partition {}:{} moved from {} to {}",
                        if is_master { "master" } else { "replica" },
                        self.namespace,
                        index,
                        previous.name(),
                        node.name()
                    );
                    previous.force_partition_refresh();
                }
            } else if holds {
                slot.store(None);
                summary.cleared += 1;
            }
        }

        summary
    }
}

impl PartitionTables {
    /// Applies one node's parsed master and prole bitmaps.
    ///
    /// Existing tables are patched in place. When a namespace is new, the
    /// returned set holds the added table and must be published by the
    /// caller; `None` means the current set is still valid.
    pub fn apply(
        &self,
        node: &Arc<Node>,
        masters: &[ReplicaBitmap],
        proles: &[ReplicaBitmap],
        partition_count: u32,
    ) -> Result<(Option<PartitionTables>, UpdateSummary)> {
        let mut next: Option<PartitionTables> = None;
        let mut summary = UpdateSummary::default();

        let updates = masters
            .iter()
            .map(|update| (update, true))
            .chain(proles.iter().map(|update| (update, false)));

        for (update, is_master) in updates {
            let existing = next
                .as_ref()
                .unwrap_or(self)
                .find(&update.namespace)
                .cloned();
            let table = match existing {
                Some(table) => table,
                None => {
                    let table = Arc::new(PartitionTable::new(&update.namespace, partition_count)?);
                    let grown = next.as_ref().unwrap_or(self).with_added(Arc::clone(&table));
                    next = Some(grown);
                    summary.namespaces_added += 1;
                    table
                }
            };
            let patched = table.update(node, &update.bitmap, is_master);
            summary.installed += patched.installed;
            summary.cleared += patched.cleared;
        }

        Ok((next, summary))
    }
}
