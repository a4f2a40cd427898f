use super::async_exec::await_reply;
use super::handler::Response;
use super::target::CommandTarget;
use crate::cluster::Cluster;
use crate::cluster::partition::partition_of;
use crate::connection::{CommandPolicy, Replica};
use crate::core::Result;
use futures::future::join_all;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// One key of a batch: where it goes and its encoded request body.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub target: CommandTarget,
    pub request: Vec<u8>,
}

impl BatchRequest {
    pub fn new(target: CommandTarget, request: Vec<u8>) -> Self {
        Self { target, request }
    }
}

impl Cluster {
    /// Runs every request as its own command and reports one result per
    /// request, in input order.
    ///
    /// Requests bound for the same node share an event loop. A failed key
    /// does not affect the others.
    pub async fn execute_batch(
        &self,
        requests: Vec<BatchRequest>,
        policy: &CommandPolicy,
    ) -> Vec<Result<Response>> {
        let mut loops: HashMap<String, usize> = HashMap::new();
        let mut pending = Vec::with_capacity(requests.len());

        for BatchRequest { target, request } in requests {
            let group = self.batch_group(&target);
            let index = *loops
                .entry(group)
                .or_insert_with(|| self.state.event_loops.next());

            let (tx, rx) = oneshot::channel();
            let submitted = self.execute_async(target, &request, policy, Some(index), move |result| {
                let _ = tx.send(result);
            });
            pending.push(await_reply(submitted, rx));
        }

        log::debug!(
            "batch of {} request(s) spread over {} node group(s)",
            pending.len(),
            loops.len()
        );
        join_all(pending).await
    }

    /// Name of the node a request currently maps to; empty when unknown.
    fn batch_group(&self, target: &CommandTarget) -> String {
        let state = &self.state;
        let node = match target {
            CommandTarget::Node(node) => return node.name().to_string(),
            CommandTarget::Key {
                namespace,
                digest,
                write,
            } => {
                let partition = partition_of(digest, state.partition_count().unwrap_or(0));
                state.node_for_partition(namespace, partition, *write, Replica::Master, true)
            }
            CommandTarget::Partition {
                namespace,
                partition,
                write,
            } => state.node_for_partition(namespace, *partition, *write, Replica::Master, true),
        };
        node.map(|node| node.name().to_string()).unwrap_or_default()
    }
}
