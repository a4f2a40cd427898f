use super::target::CommandTarget;
use crate::cluster::node::Node;
use crate::cluster::partition::partition_of;
use crate::cluster::state::ClusterState;
use crate::connection::CommandPolicy;
use crate::core::{DbError, Result, ResultCode};
use crate::protocol::compress::compress_frame;
use crate::protocol::{MessageType, encode_frame};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stages of one command, shared by the sync and async executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Created,
    Connecting,
    Writing,
    ReadingHeader,
    ReadingBody,
    Retrying,
    Succeeded,
    Failed,
}

impl CommandState {
    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Created | Retrying, Connecting)
                | (Connecting, Writing)
                | (Writing, ReadingHeader)
                | (ReadingHeader, ReadingBody)
                | (ReadingBody, ReadingHeader | Succeeded)
                | (Connecting | Writing | ReadingHeader | ReadingBody, Retrying)
                | (Created | Connecting | Writing | ReadingHeader | ReadingBody | Retrying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Succeeded | CommandState::Failed)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One command in flight: target, framed request and retry bookkeeping.
pub struct Command {
    target: CommandTarget,
    policy: CommandPolicy,
    request: Vec<u8>,
    state: CommandState,
    iteration: u32,
    deadline: Option<Instant>,
    /// Read preference of the next attempt, picked on the first one and
    /// flipped by every timeout.
    use_master: Option<bool>,
    delivered_frames: usize,
    last_node: Option<String>,
}

impl Command {
    /// Frames `body` as a data message, compressing it above the policy threshold.
    pub fn new(target: CommandTarget, body: &[u8], policy: CommandPolicy) -> Result<Self> {
        let frame = encode_frame(MessageType::Message, body)?;
        let request = match policy.compression_threshold {
            Some(threshold) if body.len() > threshold => compress_frame(&frame)?,
            _ => frame,
        };
        let deadline =
            (!policy.total_timeout.is_zero()).then(|| Instant::now() + policy.total_timeout);

        Ok(Self {
            target,
            policy,
            request,
            state: CommandState::Created,
            iteration: 0,
            deadline,
            use_master: None,
            delivered_frames: 0,
            last_node: None,
        })
    }

    pub fn target(&self) -> &CommandTarget {
        &self.target
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Attempts started so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn last_node(&self) -> Option<&str> {
        self.last_node.as_deref()
    }

    pub fn transition(&mut self, next: CommandState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DbError::Fatal(format!(
                "invalid command transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Starts the next attempt.
    pub fn begin_attempt(&mut self) -> Result<()> {
        self.transition(CommandState::Connecting)?;
        self.iteration += 1;
        Ok(())
    }

    /// Socket timeout of the current attempt, capped by the remaining total
    /// budget. Zero means no limit.
    pub fn attempt_timeout(&self) -> Result<Duration> {
        let socket = self.policy.socket_timeout;
        let Some(deadline) = self.deadline else {
            return Ok(socket);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DbError::Timeout(format!(
                "total timeout {:?} exceeded",
                self.policy.total_timeout
            )));
        }
        Ok(if socket.is_zero() {
            remaining
        } else {
            socket.min(remaining)
        })
    }

    /// Picks the node for this attempt and remembers its name.
    pub fn select_node(&mut self, cluster: &ClusterState) -> Result<Arc<Node>> {
        let replica = self.policy.replica;
        let use_master = match self.target {
            CommandTarget::Node(_) => true,
            _ => *self
                .use_master
                .get_or_insert_with(|| cluster.read_preference(replica)),
        };
        let node = match &self.target {
            CommandTarget::Node(node) => {
                if !node.is_active() {
                    return Err(DbError::NoAvailableNode(format!(
                        "node {} is no longer active",
                        node.name()
                    )));
                }
                Arc::clone(node)
            }
            CommandTarget::Key {
                namespace,
                digest,
                write,
            } => {
                let partition = partition_of(digest, cluster.partition_count().unwrap_or(0));
                cluster.node_for_partition(
                    namespace,
                    partition,
                    *write,
                    replica,
                    use_master,
                )?
            }
            CommandTarget::Partition {
                namespace,
                partition,
                write,
            } => cluster.node_for_partition(
                namespace,
                *partition,
                *write,
                replica,
                use_master,
            )?,
        };
        self.last_node = Some(node.name().to_string());
        Ok(node)
    }

    /// Error returned when a node is over its error budget.
    pub fn error_rate_exceeded(node: &Node) -> DbError {
        DbError::TransientServer {
            code: ResultCode::MAX_ERROR_RATE,
            message: format!("node {} exceeded its error rate", node.name()),
        }
    }

    /// Moves the next read to the other replica.
    pub fn on_timeout(&mut self) {
        if let Some(use_master) = self.use_master.as_mut() {
            *use_master = !*use_master;
        }
    }

    pub fn frame_delivered(&mut self) {
        self.delivered_frames += 1;
    }

    /// Whether `err` may be retried by another attempt.
    ///
    /// Never once a frame reached the handler, since a retry would deliver
    /// records twice.
    pub fn can_retry(&self, err: &DbError) -> bool {
        err.is_retryable()
            && self.delivered_frames == 0
            && self.iteration < self.policy.max_attempts()
            && self
                .deadline
                .is_none_or(|deadline| Instant::now() < deadline)
    }

    pub fn retry(&mut self) -> Result<()> {
        self.transition(CommandState::Retrying)
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(CommandState::Succeeded)
    }

    /// Wraps the last error into the terminal error handed to the caller.
    pub fn fail(&mut self, err: DbError) -> DbError {
        self.state = CommandState::Failed;
        DbError::Command {
            kind: err.kind(),
            node: self.last_node.clone(),
            iterations: self.iteration,
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryInfoTransport;
    use crate::command::event_loop::EventLoopGroup;
    use crate::connection::{ClientConfig, Replica};
    use crate::core::ErrorKind;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    fn command(policy: CommandPolicy) -> Command {
        let target = CommandTarget::Partition {
            namespace: "test".to_string(),
            partition: 1,
            write: false,
        };
        Command::new(target, b"payload", policy).unwrap()
    }

    #[test]
    fn test_state_graph() {
        use CommandState::*;
        assert!(Created.can_transition_to(Connecting));
        assert!(ReadingBody.can_transition_to(ReadingHeader));
        assert!(Retrying.can_transition_to(Connecting));
        assert!(!Succeeded.can_transition_to(Retrying));
        assert!(!Writing.can_transition_to(Succeeded));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_retry_budget_is_max_retries_plus_one() {
        let policy = CommandPolicy::default()
            .max_retries(2)
            .total_timeout(Duration::ZERO);
        let mut command = command(policy);
        let timeout = DbError::Timeout("read".into());

        let mut attempts = 0;
        loop {
            command.begin_attempt().unwrap();
            attempts += 1;
            command.transition(CommandState::Writing).unwrap();
            if !command.can_retry(&timeout) {
                break;
            }
            command.retry().unwrap();
        }
        assert_eq!(attempts, 3);

        let err = command.fail(timeout);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.iterations(), Some(3));
    }

    #[test]
    fn test_delivered_frames_block_retry() {
        let mut command = command(CommandPolicy::default());
        command.begin_attempt().unwrap();
        assert!(command.can_retry(&DbError::Timeout("x".into())));
        command.frame_delivered();
        assert!(!command.can_retry(&DbError::Timeout("x".into())));
    }

    #[test]
    fn test_attempt_timeout_is_capped_by_total() {
        let policy = CommandPolicy::default()
            .socket_timeout(Duration::from_secs(30))
            .total_timeout(Duration::from_millis(200));
        let command = command(policy);
        assert!(command.attempt_timeout().unwrap() <= Duration::from_millis(200));

        let unlimited = CommandPolicy::default()
            .socket_timeout(Duration::ZERO)
            .total_timeout(Duration::ZERO);
        assert_eq!(command_timeout(unlimited), Duration::ZERO);
    }

    fn command_timeout(policy: CommandPolicy) -> Duration {
        command(policy).attempt_timeout().unwrap()
    }

    #[test]
    fn test_large_requests_are_compressed() {
        let policy = CommandPolicy::default().compression_threshold(Some(16));
        let target = CommandTarget::Partition {
            namespace: "test".to_string(),
            partition: 0,
            write: true,
        };
        let command = Command::new(target, &[0u8; 1024], policy).unwrap();
        assert_eq!(command.request()[1], MessageType::Compressed as u8);
    }

    /// Cluster state where A1 masters and B2 replicates all 16 partitions.
    fn two_copy_state() -> ClusterState {
        let config = ClientConfig::default().event_loops(1);
        let state = ClusterState::new(
            config.clone(),
            Arc::new(InMemoryInfoTransport::new(16)),
            EventLoopGroup::start(1).unwrap(),
        );
        state.set_partition_count(16);
        let a = Arc::new(Node::new("A1", "127.0.0.1:3001".parse().unwrap(), &config).unwrap());
        let b = Arc::new(Node::new("B2", "127.0.0.1:3002".parse().unwrap(), &config).unwrap());
        state.add_nodes(&[Arc::clone(&a), Arc::clone(&b)]);
        let all = format!("test:{}", BASE64.encode([0xffu8; 2]));
        state.apply_replicas(&a, &all, "").unwrap();
        state.apply_replicas(&b, "", &all).unwrap();
        state
    }

    #[test]
    fn test_timeout_moves_read_to_other_copy() {
        let state = two_copy_state();
        for replica in [Replica::Any, Replica::Sequence] {
            let mut command = command(CommandPolicy::default().replica(replica));
            let first = command.select_node(&state).unwrap();

            // Other reads in between must not decide this command's next copy.
            state.read_preference(Replica::Any);
            state.node_for_key("test", &[0u8; 20], false).unwrap();

            command.on_timeout();
            let second = command.select_node(&state).unwrap();
            assert_ne!(first.name(), second.name(), "{:?}", replica);

            command.on_timeout();
            let third = command.select_node(&state).unwrap();
            assert_eq!(first.name(), third.name(), "{:?}", replica);
        }
        state.event_loops.shutdown();
    }

    #[test]
    fn test_without_timeout_read_stays_on_same_copy() {
        let state = two_copy_state();
        let mut command = command(CommandPolicy::default());
        let first = command.select_node(&state).unwrap();
        state.read_preference(Replica::Any);
        let again = command.select_node(&state).unwrap();
        assert_eq!(first.name(), again.name());
        state.event_loops.shutdown();
    }
}
