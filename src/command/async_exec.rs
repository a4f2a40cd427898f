use super::event_loop::EventLoopGroup;
use super::handler::{CommandOutcome, HandlerAction, Response, ResponseHandler, SingleResponse};
use super::state::{Command, CommandState};
use super::sync_exec::{inflate, record_failure};
use super::target::CommandTarget;
use crate::cluster::Cluster;
use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::cluster::stats::ClusterCounters;
use crate::connection::{AsyncConnection, CommandPolicy};
use crate::core::{DbError, Result};
use crate::protocol::MessageType;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Instrument, Level, event, info_span};

impl Cluster {
    /// Queues a single-response command on an event loop.
    ///
    /// Without an explicit `event_loop` the command stays on the caller's
    /// loop when submitted from one, otherwise loops are chosen round-robin.
    /// Every suspension point of the command resumes on that loop, and
    /// `continuation` runs there exactly once with the terminal result.
    pub fn execute_async<F>(
        &self,
        target: CommandTarget,
        request: &[u8],
        policy: &CommandPolicy,
        event_loop: Option<usize>,
        continuation: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.execute_async_with(
            target,
            request,
            policy,
            event_loop,
            SingleResponse::default(),
            move |result, handler| {
                continuation(result.and_then(|outcome| handler.into_response(outcome)))
            },
        )
    }

    /// Queues a command whose frames are interpreted by `handler`; the
    /// handler is handed back to `continuation` with the outcome.
    pub fn execute_async_with<H, F>(
        &self,
        target: CommandTarget,
        request: &[u8],
        policy: &CommandPolicy,
        event_loop: Option<usize>,
        mut handler: H,
        continuation: F,
    ) -> Result<()>
    where
        H: ResponseHandler + 'static,
        F: FnOnce(Result<CommandOutcome>, H) + Send + 'static,
    {
        if self.state.is_closed() {
            return Err(DbError::NoAvailableNode("cluster is closed".to_string()));
        }
        let command = Command::new(target, request, policy.clone())?;
        let index = self.event_loop_for(event_loop)?;
        let state = Arc::clone(&self.state);
        let span = info_span!(
            "command",
            target = %command.target(),
            mode = "async",
            event_loop = index
        );

        self.state.event_loops.spawn_on(
            index,
            async move {
                let result = run_async(&state, command, &mut handler, index).await;
                continuation(result, handler);
            }
            .instrument(span),
        )?;
        Ok(())
    }

    /// Runs a single-response command on an event loop and awaits its result.
    pub async fn execute(
        &self,
        target: CommandTarget,
        request: &[u8],
        policy: &CommandPolicy,
    ) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let submitted = self.execute_async(target, request, policy, None, move |result| {
            let _ = tx.send(result);
        });
        await_reply(submitted, rx).await
    }

    pub(crate) fn event_loop_for(&self, requested: Option<usize>) -> Result<usize> {
        let loops = &self.state.event_loops;
        match requested {
            Some(index) => {
                loops.handle(index)?;
                Ok(index)
            }
            None => Ok(EventLoopGroup::current()
                .filter(|index| *index < loops.len())
                .unwrap_or_else(|| loops.next())),
        }
    }
}

/// Waits for the continuation of a submitted command.
pub(crate) async fn await_reply(
    submitted: Result<()>,
    rx: oneshot::Receiver<Result<Response>>,
) -> Result<Response> {
    submitted?;
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(DbError::Fatal(
            "event loop stopped before the command completed".to_string(),
        )),
    }
}

async fn run_async(
    state: &ClusterState,
    mut command: Command,
    handler: &mut dyn ResponseHandler,
    index: usize,
) -> Result<CommandOutcome> {
    loop {
        command.begin_attempt()?;
        match attempt(state, &mut command, handler, index).await {
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
                    tokio::time::sleep(pause).await;
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

async fn attempt(
    state: &ClusterState,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
    index: usize,
) -> Result<HandlerAction> {
    let node = command.select_node(state)?;
    let config = state.config();
    if node.error_rate_exceeded(config.max_error_rate) {
        return Err(Command::error_rate_exceeded(&node));
    }
    node.record_command();

    let result = attempt_on_node(&node, index, config.connect_timeout, command, handler).await;
    if let Err(err) = &result {
        record_failure(state, &node, command, err);
    }
    result
}

/// One attempt under the attempt deadline. Expiry drops the in-flight
/// connection, which closes it.
async fn attempt_on_node(
    node: &Node,
    index: usize,
    connect_timeout: Duration,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    let timeout = command.attempt_timeout()?;
    if timeout.is_zero() {
        return checkout_and_exchange(node, index, connect_timeout, command, handler).await;
    }
    match tokio::time::timeout(
        timeout,
        checkout_and_exchange(node, index, connect_timeout, command, handler),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(format!(
            "no response from node {} within {:?}",
            node.name(),
            timeout
        ))),
    }
}

async fn checkout_and_exchange(
    node: &Node,
    index: usize,
    connect_timeout: Duration,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    let addr = node.primary_address()?;
    let mut guard = node
        .async_pool(index)?
        .checkout(addr, connect_timeout)
        .await?;
    let result = exchange(guard.connection()?, command, handler).await;
    match result {
        Ok(action) => {
            guard.checkin();
            Ok(action)
        }
        Err(err @ DbError::TransientServer { .. }) => {
            guard.checkin();
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn exchange(
    conn: &mut AsyncConnection,
    command: &mut Command,
    handler: &mut dyn ResponseHandler,
) -> Result<HandlerAction> {
    command.transition(CommandState::Writing)?;
    conn.write_all(command.request()).await?;

    loop {
        command.transition(CommandState::ReadingHeader)?;
        let header = conn.read_header(MessageType::Message).await?;
        command.transition(CommandState::ReadingBody)?;
        let frame = inflate(conn.read_body(header).await?)?;
        match handler.on_frame(&frame)? {
            HandlerAction::ReadMore => command.frame_delivered(),
            action => return Ok(action),
        }
    }
}
