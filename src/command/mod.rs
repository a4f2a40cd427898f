//! Command dispatch: the retry state machine and its blocking and
//! event-loop executors.

pub mod async_exec;
pub mod batch;
pub mod event_loop;
pub mod handler;
pub mod state;
pub mod sync_exec;
pub mod target;

pub use batch::BatchRequest;
pub use event_loop::EventLoopGroup;
pub use handler::{
    CommandOutcome, HandlerAction, RecordStream, Response, ResponseHandler, SingleResponse,
};
pub use state::{Command, CommandState};
pub use target::CommandTarget;
