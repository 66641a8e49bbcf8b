//! Write-side engine of the flash key-value store.
//!
//! Callers hand put/writeback/flush operations to an [`AsyncPool`]. The
//! owning worker copies the payload into its own arena, acknowledges the
//! caller, and only then applies the operation to flash and, for replicated
//! containers, to the [`Replicator`]. [`AsyncPool::drain`] gives a
//! consistency point across all workers.

pub mod actiondir;
pub mod config;
pub mod drain;
pub mod error;
pub mod flash;
pub mod flusher;
pub mod gate;
pub mod pool;
pub mod replicator;
pub mod request;
pub mod stats;
pub mod types;
mod worker;

pub use actiondir::{ActionDir, CacheEntry, CacheRef, CachedObject};
pub use config::{Dispatch, PoolConfig};
pub use drain::DrainBarrier;
pub use error::{Error, Result};
pub use flash::{FjallFlash, FlashStatus, FlashStore, MemFlash};
pub use flusher::{BackgroundFlusher, FlusherHandle};
pub use gate::{FlowControlGate, FlushToken, GateStats};
pub use pool::{ActionState, AsyncPool, ShutdownHandle};
pub use replicator::{
    decode_op, encode_op, FanoutReplicator, ReplicaApplier, ReplicaOp, ReplicationConfig,
    ReplicationError, Replicator,
};
pub use request::{AsyncRequest, Completion, Payload, RequestKind, Submitted};
pub use stats::{ContainerStatsSnapshot, PoolStatsSnapshot};
pub use types::{ContainerId, ObjectMeta, OpId, ShardId, Target};
