//! Shared types for the correlation layer.
//!
//! These are kept dependency-light because both the response map and the
//! messenger/handler traits use them, and the write engine re-uses the node
//! identifiers for its replication plumbing.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::response_map::ResponseKey;

/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Service identifier on a node (mailbox address).
pub type ServiceId = u32;

/// Default upper bound for a tracked request to wait for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default tick granularity for interval rollover and timeout detection.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// A (node, service) pair addressing one mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub node: NodeId,
    pub service: ServiceId,
}

impl Endpoint {
    pub const fn new(node: NodeId, service: ServiceId) -> Self {
        Self { node, service }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.service)
    }
}

/// Direction of a message on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
}

/// One message as handed to or received from a `Messenger`.
///
/// The envelope encoding itself belongs to the transport; this is the logical
/// view the correlation layer needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Correlation key; for replies it is copied from the request.
    pub key: ResponseKey,
    pub src: Endpoint,
    pub dest: Endpoint,
    pub seq: u64,
    pub payload: Bytes,
}

impl Message {
    /// Build the reply for this request, swapping source and destination.
    pub fn reply(&self, payload: Bytes) -> Message {
        Message {
            kind: MessageKind::Reply,
            key: self.key,
            src: self.dest,
            dest: self.src,
            seq: self.seq,
            payload,
        }
    }
}

/// Errors synthesized by the correlation layer instead of a real reply.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("no reply from {dest} within the reply timeout")]
    Timeout { dest: Endpoint },
    #[error("destination node {node} was declared dead")]
    NodeDead { node: NodeId },
    #[error("send to {dest} failed: {reason}")]
    SendFailed { dest: Endpoint, reason: String },
    #[error("reply route dropped before completion")]
    Dropped,
}

/// Result delivered to the local reply route of a tracked request.
pub type ReplyResult = Result<Message, MessageError>;

/// Timing knobs for the response map and its scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Age after which a tracked request is answered with `Timeout`.
    pub reply_timeout: Duration,
    /// Scheduler tick; also the quantum used to stamp trackers.
    pub tick: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            tick: DEFAULT_TICK,
        }
    }
}

impl TimeoutConfig {
    /// Read overrides from `HOLO_MSG_REPLY_TIMEOUT_MS` / `HOLO_MSG_TICK_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reply_timeout: Duration::from_millis(read_env_u64(
                "HOLO_MSG_REPLY_TIMEOUT_MS",
                defaults.reply_timeout.as_millis() as u64,
            )),
            tick: Duration::from_millis(read_env_u64(
                "HOLO_MSG_TICK_MS",
                defaults.tick.as_millis() as u64,
            )),
        }
    }

    /// Reject a zero tick; a timeout shorter than one tick is rounded up to it.
    pub fn validate(self) -> anyhow::Result<Self> {
        anyhow::ensure!(!self.tick.is_zero(), "tick granularity must be > 0");
        Ok(Self {
            reply_timeout: self.reply_timeout.max(self.tick),
            tick: self.tick,
        })
    }
}

/// Read an env var as u64 with a default.
fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}
