use super::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which copy of a partition a read goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Replica {
    /// Always the master.
    Master,
    /// Alternate master and replica through a cluster-wide counter.
    #[default]
    Any,
    /// Start at the master, move to the replica after a timeout.
    Sequence,
}

/// Per-command timeouts and retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPolicy {
    /// Per-attempt socket timeout; zero means no limit.
    pub socket_timeout: Duration,
    /// Deadline across all attempts; zero means no limit.
    pub total_timeout: Duration,
    pub max_retries: u32,
    pub sleep_between_retries: Duration,
    pub replica: Replica,
    /// Compress request bodies above this size.
    pub compression_threshold: Option<usize>,
}

impl CommandPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            socket_timeout: config.socket_timeout,
            total_timeout: config.total_timeout,
            max_retries: config.max_retries,
            sleep_between_retries: config.sleep_between_retries,
            replica: Replica::default(),
            compression_threshold: config.compression_threshold,
        }
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn sleep_between_retries(mut self, sleep: Duration) -> Self {
        self.sleep_between_retries = sleep;
        self
    }

    pub fn replica(mut self, replica: Replica) -> Self {
        self.replica = replica;
        self
    }

    pub fn compression_threshold(mut self, threshold: Option<usize>) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Upper bound on attempts for one command.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
