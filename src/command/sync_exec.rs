use super::handler::{CommandOutcome, HandlerAction, Response, ResponseHandler, SingleResponse};
use super::state::{Command, CommandState};
use super::target::CommandTarget;
use crate::cluster::Cluster;
use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::cluster::stats::ClusterCounters;
use crate::connection::{CommandPolicy, Connection};
use crate::core::{DbError, ErrorKind, Result};
use crate::protocol::compress::decompress_body;
use crate::protocol::{Frame, MessageType};
use std::thread;
use std::time::Duration;
use tracing::{Level, event, info_span};

impl Cluster {
    /// Runs a single-response command on the calling thread.
    ///
    /// `request` is the encoded message body; framing and compression are
    /// applied here. Blocks until success or a terminal error.
    pub fn execute_sync(
        &self,
        target: CommandTarget,
        request: &[u8],
        policy: &CommandPolicy,
    ) -> Result<Response> {
        let mut handler = SingleResponse::default();
        let outcome = self.execute_sync_with(target, request, policy, &mut handler)?;
        handler.into_response(outcome)
    }

    /// Runs a command whose frames are interpreted by `handler`.
    pub fn execute_sync_with(
        &self,
        target: CommandTarget,
        request: &[u8],
        policy: &CommandPolicy,
        handler: &mut dyn ResponseHandler,
    ) -> Result<CommandOutcome> {
        let command = Command::new(target, request, policy.clone())?;
        run_sync(&self.state, command, handler)
    }
}

fn run_sync(
    state: &ClusterState,
    mut command: Command,
    handler: &mut dyn ResponseHandler,
) -> Result<CommandOutcome> {
    let span = info_span!("command", target = %command.target(), mode = "sync");
    let _enter = span.enter();

    loop {
        command.begin_attempt()?;
        match attempt(state, &mut command, handler) {
            Ok(action) => {
                command.succeed()?;
                ClusterCounters::bump(&state.counters.command_successes);
                event!(Level::DEBUG, iterations = command.iteration(), "command completed");
                return Ok(CommandOutcome {
                    node: command.last_node().map(str::to_string),
                    iterations: command.iteration(),
                    aborted: action == HandlerAction::Abort,
                });
            }
            Err(err) if command.can_retry(&err) => {
                event!(
                    Level::DEBUG,
                    iteration = command.iteration(),
                    node = command.last_node().unwrap_or("<none>"),
                    error = %err,
                    "command retry"
                );
                ClusterCounters::bump(&state.counters.command_retries);
                command.retry()?;
                let pause = command.policy().sleep_between_retries;
                if !pause.is_zero() {
                    thread::sleep(pause);
                }
            }
            Err(err) => {
                ClusterCounters::bump(&state.counters.command_failures);
                event!(Level::DEBUG, error = %err, "command failed");
                return Err(command.fail(err));
            }
        }
    }
}

fn attempt(
    state: &ClusterState,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    let node = command.select_node(state)?;
    let config = state.config();
    if node.error_rate_exceeded(config.max_error_rate) {
        return Err(Command::error_rate_exceeded(&node));
    }
    node.record_command();

    let result = attempt_on_node(&node, config.connect_timeout, command, handler);
    if let Err(err) = &result {
        record_failure(state, &node, command, err);
    }
    result
}

fn attempt_on_node(
    node: &Node,
    connect_timeout: Duration,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    command.attempt_timeout()?;
    let addr = node.primary_address()?;
    let mut guard = node.pool().checkout(addr, connect_timeout)?;
    let result = exchange(guard.connection()?, command, handler);
    match result {
        Ok(action) => {
            guard.checkin();
            Ok(action)
        }
        Err(err @ DbError::TransientServer { .. }) => {
            guard.checkin();
            Err(err)
        }
        // Dropping the guard closes the connection.
        Err(err) => Err(err),
    }
}

/// Writes the request and feeds frames to the handler until it is done.
/// Each socket operation is bounded by the time left in the attempt.
fn exchange(
    conn: &mut Connection,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    conn.set_timeout(command.attempt_timeout()?)?;
    command.transition(CommandState::Writing)?;
    conn.write_all(command.request())?;

    loop {
        command.transition(CommandState::ReadingHeader)?;
        conn.set_timeout(command.attempt_timeout()?)?;
        let header = conn.read_header(MessageType::Message)?;
        command.transition(CommandState::ReadingBody)?;
        conn.set_timeout(command.attempt_timeout()?)?;
        let frame = inflate(conn.read_body(header)?)?;
        match handler.on_frame(&frame)? {
            HandlerAction::ReadMore => command.frame_delivered(),
            action => return Ok(action),
        }
    }
}

/// Unwraps a compressed response into the data message it carries.
pub(super) fn inflate(frame: Frame) -> Result<Frame> {
    if frame.msg_type() != MessageType::Compressed {
        return Ok(frame);
    }
    let inner = decompress_body(&frame.body)?;
    inner.header.expect(MessageType::Message)?;
    Ok(inner)
}

/// Node health and cluster counters after a failed attempt.
pub(super) fn record_failure(
    state: &ClusterState,
    node: &Node,
    command: &mut Command,
    err: &DbError,
) {
    match err.kind() {
        ErrorKind::Timeout => {
            node.record_timeout();
            ClusterCounters::bump(&state.counters.command_timeouts);
            command.on_timeout();
        }
        ErrorKind::ClientAbort | ErrorKind::ConnectionExhausted => {}
        _ => node.record_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compress::compress_frame;
    use crate::protocol::encode_frame;
    use crate::protocol::message::MessageHeader;

    #[test]
    fn test_inflate_passes_plain_frames_through() {
        let frame = Frame::new(MessageType::Message, vec![1, 2, 3]).unwrap();
        assert_eq!(inflate(frame.clone()).unwrap(), frame);
    }

    #[test]
    fn test_inflate_unwraps_compressed_message() {
        let body = MessageHeader::default().encode().to_vec();
        let plain = encode_frame(MessageType::Message, &body).unwrap();
        let wrapped = Frame::from_bytes(&compress_frame(&plain).unwrap()).unwrap();
        assert_eq!(wrapped.msg_type(), MessageType::Compressed);

        let inner = inflate(wrapped).unwrap();
        assert_eq!(inner.msg_type(), MessageType::Message);
        assert_eq!(inner.body, body);
    }

    #[test]
    fn test_compressed_info_frame_is_rejected() {
        let plain = encode_frame(MessageType::Info, b"node\tA1\n").unwrap();
        let wrapped = Frame::from_bytes(&compress_frame(&plain).unwrap()).unwrap();
        assert!(matches!(inflate(wrapped), Err(DbError::Protocol(_))));
    }
}
