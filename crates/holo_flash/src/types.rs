//! Identity and metadata types shared by the write path.

use std::fmt;

use serde::Serialize;

/// Container identifier assigned by the metadata service.
pub type ContainerId = u64;
/// Shard within a container.
pub type ShardId = u64;
/// Caller-assigned operation identifier, carried through to logs and replicas.
pub type OpId = u64;

/// The container/shard an object lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub container: ContainerId,
    pub shard: ShardId,
}

impl Target {
    pub const fn new(container: ContainerId, shard: ShardId) -> Self {
        Self { container, shard }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.shard)
    }
}

/// Per-object attributes stored alongside the data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObjectMeta {
    /// Absolute expiry in seconds since the Unix epoch; 0 never expires.
    pub expiry: u64,
    pub flags: u32,
}
