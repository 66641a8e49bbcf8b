//! Request/response correlation for cluster messaging.
//!
//! A `ResponseMap` remembers every request that still expects a reply and a
//! `TimeoutScheduler` ticks it so unanswered requests fail with a timeout.
//! The `Correlator` ties the map to a `Messenger` and to service inboxes.

pub mod correlator;
pub mod loopback;
pub mod response_map;
pub mod scheduler;
pub mod types;

pub use correlator::{Correlator, Messenger, ServiceHandler};
pub use loopback::LoopbackNetwork;
pub use response_map::{
    lock_map, shared, Bucket, BucketCounts, Markers, ParseResponseKeyError, ReplyRoute,
    ResponseKey, ResponseMap, ResponseMapStats, ResponseTracker, SharedResponseMap, TickReport,
};
pub use scheduler::{SchedulerHandle, TimeoutScheduler};
pub use types::{
    Endpoint, Message, MessageError, MessageKind, NodeId, ReplyResult, ServiceId, TimeoutConfig,
    DEFAULT_REPLY_TIMEOUT, DEFAULT_TICK,
};
