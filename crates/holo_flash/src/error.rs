use holo_msg::NodeId;

use crate::flash::FlashStatus;
use crate::replicator::ReplicationError;
use crate::types::ContainerId;

/// Failures surfaced by the write path.
///
/// Only `ConfigInvalid` and `AllocationFailed` raised while building the pool
/// are meant to abort startup. Everything else is per-operation and is
/// delivered on the request's completion channel.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("flash apply failed for container {container}: {status}")]
    ApplyFailed {
        container: ContainerId,
        status: FlashStatus,
    },
    #[error("replication failed for container {container}: {source}")]
    ReplicationFailed {
        container: ContainerId,
        #[source]
        source: ReplicationError,
    },
    #[error("replication for container {container} timed out")]
    Timeout { container: ContainerId },
    #[error("replica node {node} for container {container} is dead")]
    NodeDead {
        container: ContainerId,
        node: NodeId,
    },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },
    #[error("key length {len} exceeds maximum {max}")]
    KeyTooLong { len: usize, max: usize },
    #[error("key must not be empty")]
    InvalidKey,
    #[error("object size {len} exceeds maximum {max}")]
    ObjectTooLarge { len: usize, max: usize },
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("worker pool has not been started")]
    NotStarted,
    #[error("worker pool was already started")]
    AlreadyStarted,
}

impl Error {
    /// Map a replication failure to the error the caller sees.
    ///
    /// Timeouts and node deaths keep their own kinds so callers can tell them
    /// apart from a replica that actually rejected the write.
    pub fn from_replication(container: ContainerId, err: ReplicationError) -> Self {
        use holo_msg::MessageError;
        match err {
            ReplicationError::Message(MessageError::Timeout { .. }) => Error::Timeout { container },
            ReplicationError::Message(MessageError::NodeDead { node }) => {
                Error::NodeDead { container, node }
            }
            other => Error::ReplicationFailed {
                container,
                source: other,
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
