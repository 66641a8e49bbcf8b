//! Worker loop: copy, acknowledge, then apply.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::actiondir::CacheEntry;
use crate::error::{Error, Result};
use crate::flash::FlashStatus;
use crate::gate::FlushToken;
use crate::pool::PoolState;
use crate::replicator::{ReplicaOp, ReplicationError};
use crate::request::{AsyncRequest, Envelope, Payload, Request, RequestKind, Returned};
use crate::stats::{should_log_failure, ContainerStats};
use crate::types::{ContainerId, ObjectMeta, OpId, Target};

/// Everything a worker needs after the caller has been released.
struct Captured {
    op_id: OpId,
    kind: RequestKind,
    target: Target,
    meta: ObjectMeta,
    replicate: bool,
    /// Cache entry the bytes came from and the version that was copied.
    source: Option<(Weak<CacheEntry>, u64)>,
}

pub(crate) struct WorkerState {
    index: usize,
    key: Vec<u8>,
    data: Vec<u8>,
    /// False when the current operation is a delete.
    has_data: bool,
    inbox: mpsc::Receiver<Request>,
    pool: Arc<PoolState>,
    stats: HashMap<ContainerId, Arc<ContainerStats>>,
}

impl WorkerState {
    /// Reserve the key and data arenas up front so the hot path never grows them.
    pub(crate) fn alloc(
        index: usize,
        inbox: mpsc::Receiver<Request>,
        pool: Arc<PoolState>,
    ) -> Result<Self> {
        let key = reserve_exact(pool.config.max_key_len)?;
        let data = reserve_exact(pool.config.max_object_size)?;
        Ok(Self {
            index,
            key,
            data,
            has_data: false,
            inbox,
            pool,
            stats: HashMap::new(),
        })
    }

    pub(crate) async fn run(mut self, ready: mpsc::Sender<usize>) {
        // Warm the per-worker stats context before declaring readiness.
        self.stats.reserve(8);
        if ready.send(self.index).await.is_err() {
            tracing::warn!(worker = self.index, "pool start abandoned before worker ready");
        }
        drop(ready);

        while let Some(request) = self.inbox.recv().await {
            match request {
                Request::Op(envelope) => self.handle(envelope).await,
                Request::Drain { generation } => self.pool.drain.arrive(self.index, generation),
                Request::Exit => break,
            }
        }

        // Drains queued behind the exit still need their post; dropped ops
        // fail with PoolClosed on the caller side.
        self.inbox.close();
        while let Ok(request) = self.inbox.try_recv() {
            if let Request::Drain { generation } = request {
                self.pool.drain.arrive(self.index, generation);
            }
        }
        tracing::debug!(worker = self.index, "worker exiting");
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope {
            request,
            ack,
            completion,
        } = envelope;
        let AsyncRequest {
            op_id,
            kind,
            target,
            key,
            payload,
            meta,
            replicate,
        } = request;

        let source = match self.capture(&key, &payload) {
            Ok(source) => source,
            Err(err) => {
                let stats = self.container_stats(target.container);
                stats.record_apply_failure();
                tracing::debug!(worker = self.index, error = %err, "payload capture failed");
                if let (RequestKind::BackgroundFlush, Payload::Cached(entry)) = (kind, &payload) {
                    entry.release_claim();
                }
                if ack.send(Err(err.clone())).is_err() {
                    tracing::trace!(worker = self.index, op_id, "submitter gone before ack");
                }
                self.complete(op_id, completion, Err(err));
                return;
            }
        };

        // The caller may reuse its buffers from here on.
        let buffer = match payload {
            Payload::Inline(buffer) => Some(buffer),
            Payload::Cached(_) | Payload::Delete => None,
        };
        if ack.send(Ok(Returned { key, buffer })).is_err() {
            tracing::trace!(worker = self.index, op_id, "submitter gone before ack");
        }

        let captured = Captured {
            op_id,
            kind,
            target,
            meta,
            replicate,
            source,
        };
        let result = self.execute(&captured).await;
        self.complete(op_id, completion, result);
    }

    /// Every dequeued operation counts as completed exactly once, whether or
    /// not anyone still waits on the result.
    fn complete(&self, op_id: OpId, completion: oneshot::Sender<Result<()>>, result: Result<()>) {
        self.pool.counters.completed.fetch_add(1, Ordering::Relaxed);
        if completion.send(result).is_err() {
            tracing::trace!(worker = self.index, op_id, "completion dropped by caller");
        }
    }

    /// Copy the key and object bytes into the worker's arenas.
    fn capture(&mut self, key: &[u8], payload: &Payload) -> Result<Option<(Weak<CacheEntry>, u64)>> {
        let max_key = self.key.capacity();
        if key.len() > max_key {
            return Err(Error::KeyTooLong {
                len: key.len(),
                max: max_key,
            });
        }
        self.key.clear();
        self.key.extend_from_slice(key);

        let max_object = self.data.capacity();
        self.data.clear();
        match payload {
            Payload::Inline(buffer) => {
                if buffer.len() > max_object {
                    return Err(Error::ObjectTooLarge {
                        len: buffer.len(),
                        max: max_object,
                    });
                }
                self.data.extend_from_slice(buffer);
                self.has_data = true;
                Ok(None)
            }
            Payload::Cached(entry) => {
                let object = entry.read();
                match &object.data {
                    Some(bytes) => {
                        if bytes.len() > max_object {
                            return Err(Error::ObjectTooLarge {
                                len: bytes.len(),
                                max: max_object,
                            });
                        }
                        self.data.extend_from_slice(bytes);
                        self.has_data = true;
                    }
                    None => self.has_data = false,
                }
                Ok(Some((Arc::downgrade(entry), object.version)))
            }
            Payload::Delete => {
                self.has_data = false;
                Ok(None)
            }
        }
    }

    async fn execute(&mut self, op: &Captured) -> Result<()> {
        let stats = self.container_stats(op.target.container);

        let applied = {
            let _token = self.flush_token(op.kind).await;
            self.apply(op).await
        };

        let cached = op
            .source
            .as_ref()
            .and_then(|(entry, version)| entry.upgrade().map(|entry| (entry, *version)));
        let release = |entry: &CacheEntry| {
            if op.kind == RequestKind::BackgroundFlush {
                entry.release_claim();
            }
        };

        if let Err(err) = applied {
            if let Some((entry, _)) = &cached {
                release(entry.as_ref());
            }
            let failures = stats.record_apply_failure();
            if should_log_failure(failures) {
                tracing::warn!(
                    worker = self.index,
                    container = op.target.container,
                    op_id = op.op_id,
                    failures,
                    error = %err,
                    "flash apply failed"
                );
            }
            return Err(err);
        }

        let written = if self.has_data { self.data.len() } else { 0 };
        stats.record_applied(op.kind, written, !self.has_data);
        // Clean before releasing the claim so the next scan cannot queue
        // the same version again.
        if let Some((entry, version)) = cached {
            entry.mark_clean(version);
            release(entry.as_ref());
        }

        if op.replicate && op.kind.replicates() {
            self.replicate(op, &stats).await?;
        }
        Ok(())
    }

    /// Flushes hold a token from the matching gate while they apply. The
    /// token is a guard, so it is returned on every exit path.
    async fn flush_token(&self, kind: RequestKind) -> Option<FlushToken> {
        match kind {
            RequestKind::Flush => Some(self.pool.flush_gate.acquire().await),
            RequestKind::BackgroundFlush => Some(self.pool.background_flush_gate.acquire().await),
            RequestKind::Put | RequestKind::Writeback => None,
        }
    }

    async fn apply(&self, op: &Captured) -> Result<()> {
        let flash = &self.pool.action.flash;
        let data = self.has_data.then_some(&self.data[..]);
        let status = match op.kind {
            RequestKind::Put => flash.put(op.target, &self.key, data, op.meta).await,
            RequestKind::Writeback => flash.writeback(op.target, &self.key, data, op.meta).await,
            RequestKind::Flush | RequestKind::BackgroundFlush => {
                flash.flush(op.target, &self.key, data, op.meta).await
            }
        };
        match status {
            Ok(()) => Ok(()),
            // Deleting an object flash never saw leaves flash as requested.
            Err(FlashStatus::NotFound) if data.is_none() => Ok(()),
            Err(status) => Err(Error::ApplyFailed {
                container: op.target.container,
                status,
            }),
        }
    }

    async fn replicate(&self, op: &Captured, stats: &ContainerStats) -> Result<()> {
        let action = &self.pool.action;
        let Some(replicator) = action.replicator() else {
            return Ok(());
        };
        if !action.replication_enabled(op.target.container) {
            return Ok(());
        }
        if action.is_fenced() {
            stats.record_replication_failure();
            return Err(Error::ReplicationFailed {
                container: op.target.container,
                source: ReplicationError::Unrecoverable("replication is fenced".into()),
            });
        }

        let copied = copy_out(&self.key).and_then(|key| {
            let data = if self.has_data {
                Some(copy_out(&self.data)?)
            } else {
                None
            };
            Ok((key, data))
        });
        let (key, data) = match copied {
            Ok(copied) => copied,
            Err(err) => {
                stats.record_replication_failure();
                tracing::warn!(
                    worker = self.index,
                    container = op.target.container,
                    op_id = op.op_id,
                    error = %err,
                    "replica copy failed"
                );
                return Err(err);
            }
        };
        let replica_op = ReplicaOp {
            op_id: op.op_id,
            kind: op.kind,
            target: op.target,
            key,
            data,
            meta: op.meta,
        };
        match replicator.replicate(&replica_op).await {
            Ok(()) => {
                stats.record_replicated();
                Ok(())
            }
            Err(err) => {
                let failures = stats.record_replication_failure();
                if let ReplicationError::Unrecoverable(reason) = &err {
                    if action.fence() {
                        tracing::error!(
                            container = op.target.container,
                            reason = %reason,
                            "unrecoverable replication failure, fencing replication"
                        );
                    }
                } else if should_log_failure(failures) {
                    tracing::warn!(
                        worker = self.index,
                        container = op.target.container,
                        op_id = op.op_id,
                        failures,
                        error = %err,
                        "replication failed"
                    );
                }
                Err(Error::from_replication(op.target.container, err))
            }
        }
    }

    fn container_stats(&mut self, container: ContainerId) -> Arc<ContainerStats> {
        let registry = &self.pool.action.stats;
        self.stats
            .entry(container)
            .or_insert_with(|| registry.container(container))
            .clone()
    }
}

/// Fallible copy of arena bytes for work that outlives the arena.
fn copy_out(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = reserve_exact(bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(out)
}

fn reserve_exact(bytes: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes)
        .map_err(|_| Error::AllocationFailed { bytes })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_out_duplicates_the_arena() {
        let arena = vec![7u8; 32];
        let copy = copy_out(&arena[..5]).unwrap();
        assert_eq!(copy, vec![7u8; 5]);
        assert!(copy_out(&[]).unwrap().is_empty());
    }

    #[test]
    fn impossible_reservation_is_an_error() {
        assert_eq!(
            reserve_exact(usize::MAX).unwrap_err(),
            Error::AllocationFailed { bytes: usize::MAX }
        );
    }
}
