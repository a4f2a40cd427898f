use std::fmt;
use std::io;
use thiserror::Error;

use super::result_code::ResultCode;

/// Failure classes the command executor reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    TransientServer,
    ClientAbort,
    Protocol,
    NoAvailableNode,
    ConnectionExhausted,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::TransientServer => "Transient server error",
            ErrorKind::ClientAbort => "Client abort",
            ErrorKind::Protocol => "Protocol error",
            ErrorKind::NoAvailableNode => "No available node",
            ErrorKind::ConnectionExhausted => "Connection pool exhausted",
            ErrorKind::Fatal => "Fatal error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transient server error {code}: {message}")]
    TransientServer { code: ResultCode, message: String },

    #[error("Client aborted command")]
    ClientAbort,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No available node: {0}")]
    NoAvailableNode(String),

    #[error("No more connections available to node {0}")]
    ConnectionExhausted(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Server error {code}: {message}")]
    Server { code: ResultCode, message: String },

    /// Terminal error delivered to the caller once a command gives up.
    #[error(
        "{kind} on node {} after {iterations} iteration(s): {source}",
        .node.as_deref().unwrap_or("<none>")
    )]
    Command {
        kind: ErrorKind,
        node: Option<String>,
        iterations: u32,
        source: Box<DbError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Maps the error onto the executor's failure classes.
    ///
    /// Plain socket failures (reset, refused, EOF) are grouped with timeouts:
    /// they say nothing about data movement on the server and are retried
    /// the same way.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Timeout(_) | DbError::IoError(_) => ErrorKind::Timeout,
            DbError::TransientServer { .. } => ErrorKind::TransientServer,
            DbError::ClientAbort => ErrorKind::ClientAbort,
            DbError::Protocol(_) => ErrorKind::Protocol,
            DbError::NoAvailableNode(_) => ErrorKind::NoAvailableNode,
            DbError::ConnectionExhausted(_) => ErrorKind::ConnectionExhausted,
            DbError::Command { kind, .. } => *kind,
            DbError::Fatal(_)
            | DbError::Server { .. }
            | DbError::InvalidConfig(_)
            | DbError::InvalidArgument(_)
            | DbError::ParseError(_)
            | DbError::LockError(_) => ErrorKind::Fatal,
        }
    }

    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::TransientServer
                | ErrorKind::ConnectionExhausted
                | ErrorKind::NoAvailableNode
        )
    }

    /// Name of the node the command last talked to, for terminal errors.
    pub fn node(&self) -> Option<&str> {
        match self {
            DbError::Command { node, .. } => node.as_deref(),
            _ => None,
        }
    }

    /// Number of attempts made, for terminal errors.
    pub fn iterations(&self) -> Option<u32> {
        match self {
            DbError::Command { iterations, .. } => Some(*iterations),
            _ => None,
        }
    }

    /// Server result code carried by the error, if any.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            DbError::TransientServer { code, .. } | DbError::Server { code, .. } => Some(*code),
            DbError::Command { source, .. } => source.result_code(),
            _ => None,
        }
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeouts_map_to_timeout_kind() {
        let err: DbError = io::Error::new(io::ErrorKind::WouldBlock, "read").into();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err: DbError = io::Error::new(io::ErrorKind::TimedOut, "read").into();
        assert!(matches!(err, DbError::Timeout(_)));

        let err: DbError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, DbError::IoError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_terminal_error_reports_context() {
        let err = DbError::Command {
            kind: ErrorKind::Timeout,
            node: Some("BB9020011AC4202".to_string()),
            iterations: 3,
            source: Box::new(DbError::Timeout("socket read".to_string())),
        };

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.node(), Some("BB9020011AC4202"));
        assert_eq!(err.iterations(), Some(3));
        let text = err.to_string();
        assert!(text.contains("BB9020011AC4202"));
        assert!(text.contains("3 iteration"));
    }

    #[test]
    fn test_fatal_classes_are_not_retryable() {
        assert!(!DbError::Protocol("bad version".into()).is_retryable());
        assert!(!DbError::Fatal("auth".into()).is_retryable());
        assert!(!DbError::ClientAbort.is_retryable());
        assert!(DbError::ConnectionExhausted("n1".into()).is_retryable());
    }

    #[test]
    fn test_result_code_passthrough() {
        let err = DbError::Command {
            kind: ErrorKind::TransientServer,
            node: None,
            iterations: 1,
            source: Box::new(DbError::TransientServer {
                code: ResultCode::DEVICE_OVERLOAD,
                message: "overload".into(),
            }),
        };
        assert_eq!(err.result_code(), Some(ResultCode::DEVICE_OVERLOAD));
    }
}
