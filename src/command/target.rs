use crate::cluster::node::Node;
use crate::cluster::partition::DIGEST_SIZE;
use std::fmt;
use std::sync::Arc;

/// Where a command is sent.
#[derive(Clone)]
pub enum CommandTarget {
    /// A node chosen by the caller; never re-selected on retry.
    Node(Arc<Node>),
    /// The node owning the key's partition.
    Key {
        namespace: String,
        digest: [u8; DIGEST_SIZE],
        write: bool,
    },
    /// The node owning an explicit partition.
    Partition {
        namespace: String,
        partition: u32,
        write: bool,
    },
}

impl CommandTarget {
    pub fn read(namespace: &str, digest: [u8; DIGEST_SIZE]) -> Self {
        CommandTarget::Key {
            namespace: namespace.to_string(),
            digest,
            write: false,
        }
    }

    pub fn write(namespace: &str, digest: [u8; DIGEST_SIZE]) -> Self {
        CommandTarget::Key {
            namespace: namespace.to_string(),
            digest,
            write: true,
        }
    }

    pub fn is_write(&self) -> bool {
        match self {
            CommandTarget::Node(_) => false,
            CommandTarget::Key { write, .. } | CommandTarget::Partition { write, .. } => *write,
        }
    }
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandTarget::Node(node) => write!(f, "node {}", node.name()),
            CommandTarget::Key {
                namespace,
                digest,
                write,
            } => {
                write!(f, "{} {}:", if *write { "write" } else { "read" }, namespace)?;
                for byte in &digest[..4] {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            CommandTarget::Partition {
                namespace,
                partition,
                write,
            } => write!(
                f,
                "{} {} partition {}",
                if *write { "write" } else { "read" },
                namespace,
                partition
            ),
        }
    }
}

impl fmt::Debug for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandTarget({})", self)
    }
}
