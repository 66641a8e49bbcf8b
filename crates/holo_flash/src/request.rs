//! Requests handed to the worker pool and the handles returned to callers.

use tokio::sync::oneshot;

use crate::actiondir::CacheRef;
use crate::error::{Error, Result};
use crate::types::{ObjectMeta, OpId, Target};

/// Operation kinds that carry a payload.
///
/// Drains and worker exit are issued through `AsyncPool::drain` and
/// `AsyncPool::shutdown` rather than submitted by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Put,
    Writeback,
    Flush,
    BackgroundFlush,
}

impl RequestKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            RequestKind::Put => 0,
            RequestKind::Writeback => 1,
            RequestKind::Flush => 2,
            RequestKind::BackgroundFlush => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RequestKind::Put),
            1 => Some(RequestKind::Writeback),
            2 => Some(RequestKind::Flush),
            3 => Some(RequestKind::BackgroundFlush),
            _ => None,
        }
    }

    /// Only puts and writebacks are fanned out to replicas.
    pub fn replicates(self) -> bool {
        matches!(self, RequestKind::Put | RequestKind::Writeback)
    }
}

/// Where the object bytes come from.
pub enum Payload {
    /// Caller-owned buffer, handed back once the worker has copied it.
    Inline(Vec<u8>),
    /// Live cache entry, copied out under the entry's lock.
    Cached(CacheRef),
    /// No data: delete the object.
    Delete,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Inline(buf) => write!(f, "Inline({} bytes)", buf.len()),
            Payload::Cached(entry) => write!(f, "Cached({})", entry.target()),
            Payload::Delete => f.write_str("Delete"),
        }
    }
}

#[derive(Debug)]
pub struct AsyncRequest {
    pub op_id: OpId,
    pub kind: RequestKind,
    pub target: Target,
    pub key: Vec<u8>,
    pub payload: Payload,
    pub meta: ObjectMeta,
    /// Cleared for operations that arrived from a replica.
    pub replicate: bool,
}

impl AsyncRequest {
    pub fn new(kind: RequestKind, target: Target, key: Vec<u8>, payload: Payload) -> Self {
        Self {
            op_id: 0,
            kind,
            target,
            key,
            payload,
            meta: ObjectMeta::default(),
            replicate: true,
        }
    }

    pub fn put(target: Target, key: Vec<u8>, data: Vec<u8>) -> Self {
        Self::new(RequestKind::Put, target, key, Payload::Inline(data))
    }

    pub fn delete(target: Target, key: Vec<u8>) -> Self {
        Self::new(RequestKind::Put, target, key, Payload::Delete)
    }

    /// Build a request whose bytes come from a cache entry.
    pub fn from_cache(kind: RequestKind, entry: CacheRef) -> Self {
        let target = entry.target();
        let key = entry.key().to_vec();
        Self::new(kind, target, key, Payload::Cached(entry))
    }

    pub fn writeback(entry: CacheRef) -> Self {
        Self::from_cache(RequestKind::Writeback, entry)
    }

    pub fn flush(entry: CacheRef) -> Self {
        Self::from_cache(RequestKind::Flush, entry)
    }

    pub fn background_flush(entry: CacheRef) -> Self {
        Self::from_cache(RequestKind::BackgroundFlush, entry)
    }

    pub fn with_op_id(mut self, op_id: OpId) -> Self {
        self.op_id = op_id;
        self
    }

    pub fn with_meta(mut self, meta: ObjectMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn local_only(mut self) -> Self {
        self.replicate = false;
        self
    }
}

/// Caller buffers returned with the acknowledgement.
pub(crate) struct Returned {
    pub(crate) key: Vec<u8>,
    pub(crate) buffer: Option<Vec<u8>>,
}

/// One submitted operation as it travels to a worker.
pub(crate) struct Envelope {
    pub(crate) request: AsyncRequest,
    pub(crate) ack: oneshot::Sender<Result<Returned>>,
    pub(crate) completion: oneshot::Sender<Result<()>>,
}

pub(crate) enum Request {
    Op(Envelope),
    Drain { generation: u64 },
    Exit,
}

/// Returned by `submit` once the worker owns a copy of the payload.
#[derive(Debug)]
pub struct Submitted {
    op_id: OpId,
    worker: usize,
    key: Vec<u8>,
    buffer: Option<Vec<u8>>,
    completion: Completion,
}

impl Submitted {
    pub(crate) fn new(op_id: OpId, worker: usize, returned: Returned, completion: Completion) -> Self {
        Self {
            op_id,
            worker,
            key: returned.key,
            buffer: returned.buffer,
            completion,
        }
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    /// Index of the worker the request was queued on.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// The inline data buffer, free for reuse.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    pub fn take_key(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.key)
    }

    /// Wait for the flash apply (and replication, if any) to finish.
    pub async fn wait(self) -> Result<()> {
        self.completion.wait().await
    }

    pub fn into_completion(self) -> Completion {
        self.completion
    }
}

#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::PoolClosed))
    }
}
