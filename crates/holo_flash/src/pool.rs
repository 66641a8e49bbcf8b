//! The asynchronous worker pool.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::join_all;
use holo_msg::NodeId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actiondir::ActionDir;
use crate::config::{clamp_flush_limit, Dispatch, PoolConfig};
use crate::drain::DrainBarrier;
use crate::error::{Error, Result};
use crate::flash::FlashStore;
use crate::gate::FlowControlGate;
use crate::replicator::Replicator;
use crate::request::{AsyncRequest, Completion, Envelope, Payload, Request, Submitted};
use crate::stats::{PoolCounters, PoolStatsSnapshot, StatsRegistry};
use crate::types::{ContainerId, Target};
use crate::worker::WorkerState;

/// Shared collaborators the workers act on: flash, the cache, the optional
/// replicator and the per-container replication policy.
pub struct ActionState {
    pub(crate) flash: Arc<dyn FlashStore>,
    cache: Arc<ActionDir>,
    replicator: Option<Arc<dyn Replicator>>,
    replicated_containers: RwLock<HashSet<ContainerId>>,
    fenced: AtomicBool,
    pub(crate) stats: StatsRegistry,
}

impl ActionState {
    pub fn new(flash: Arc<dyn FlashStore>, cache: Arc<ActionDir>) -> Self {
        Self {
            flash,
            cache,
            replicator: None,
            replicated_containers: RwLock::new(HashSet::new()),
            fenced: AtomicBool::new(false),
            stats: StatsRegistry::default(),
        }
    }

    pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn cache(&self) -> &Arc<ActionDir> {
        &self.cache
    }

    pub fn replicator(&self) -> Option<&Arc<dyn Replicator>> {
        self.replicator.as_ref()
    }

    /// Turn replication on or off for one container.
    pub fn set_replication(&self, container: ContainerId, enabled: bool) {
        let mut containers = self
            .replicated_containers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if enabled {
            containers.insert(container);
        } else {
            containers.remove(&container);
        }
    }

    pub fn replication_enabled(&self, container: ContainerId) -> bool {
        self.replicator.is_some()
            && self
                .replicated_containers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&container)
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    /// Returns true for the call that actually fenced replication.
    pub(crate) fn fence(&self) -> bool {
        !self.fenced.swap(true, Ordering::AcqRel)
    }
}

/// State shared by every worker for the life of the pool.
pub(crate) struct PoolState {
    pub(crate) config: PoolConfig,
    pub(crate) action: Arc<ActionState>,
    pub(crate) flush_gate: Arc<FlowControlGate>,
    pub(crate) background_flush_gate: Arc<FlowControlGate>,
    pub(crate) drain: DrainBarrier,
    pub(crate) counters: PoolCounters,
}

const UNSTARTED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

struct PoolInner {
    state: Arc<PoolState>,
    inboxes: Vec<mpsc::Sender<Request>>,
    lifecycle: AtomicU8,
    next_worker: AtomicUsize,
    unstarted: Mutex<Option<Vec<WorkerState>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the worker pool. Cheap to clone; all clones drive the same workers.
#[derive(Clone)]
pub struct AsyncPool {
    inner: Arc<PoolInner>,
}

impl AsyncPool {
    /// Validate `config`, size every worker's arenas and wire the workers to
    /// the cache's flush gates. The pool is returned unstarted.
    pub fn alloc(config: PoolConfig, action: Arc<ActionState>) -> Result<Self> {
        let config = config.validate()?;
        let cache = action.cache().clone();
        if cache.max_object_size() > config.max_object_size {
            return Err(Error::ConfigInvalid(format!(
                "cache admits objects of {} bytes but workers hold at most {}",
                cache.max_object_size(),
                config.max_object_size
            )));
        }

        let flush_gate = cache.flush_gate().clone();
        let background_flush_gate = cache.background_flush_gate().clone();
        flush_gate.set_limit(config.max_flushes_in_progress);
        background_flush_gate.set_limit(config.max_background_flushes_in_progress);

        let state = Arc::new(PoolState {
            config: config.clone(),
            action,
            flush_gate,
            background_flush_gate,
            drain: DrainBarrier::new(),
            counters: PoolCounters::default(),
        });

        let mut inboxes = Vec::with_capacity(config.threads);
        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            inboxes.push(tx);
            workers.push(WorkerState::alloc(index, rx, state.clone())?);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                state,
                inboxes,
                lifecycle: AtomicU8::new(UNSTARTED),
                next_worker: AtomicUsize::new(0),
                unstarted: Mutex::new(Some(workers)),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the workers and wait until each one has reported ready.
    pub async fn start(&self) -> Result<()> {
        match self.inner.lifecycle.load(Ordering::Acquire) {
            UNSTARTED => {}
            RUNNING => return Err(Error::AlreadyStarted),
            _ => return Err(Error::PoolClosed),
        }
        if let Some(replicator) = self.inner.state.action.replicator() {
            replicator
                .start()
                .await
                .map_err(|err| Error::ConfigInvalid(format!("replicator start failed: {err:#}")))?;
        }

        let workers = self
            .inner
            .unstarted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let count = workers.len();

        let (ready_tx, mut ready_rx) = mpsc::channel(count);
        let handles: Vec<JoinHandle<()>> = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(ready_tx.clone())))
            .collect();
        drop(ready_tx);
        *self.workers() = handles;

        let mut ready = 0;
        while ready < count {
            if ready_rx.recv().await.is_none() {
                return Err(Error::PoolClosed);
            }
            ready += 1;
        }

        if self
            .inner
            .lifecycle
            .compare_exchange(UNSTARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::PoolClosed);
        }

        let config = &self.inner.state.config;
        tracing::info!(
            threads = config.threads,
            max_flushes = config.max_flushes_in_progress,
            max_background_flushes = config.max_background_flushes_in_progress,
            dispatch = %config.dispatch,
            "worker pool started"
        );
        Ok(())
    }

    /// Queue `request` and wait until the worker has copied its payload.
    ///
    /// The returned `Submitted` hands back the caller's buffers and carries
    /// the completion of the flash apply and replication.
    pub async fn submit(&self, request: AsyncRequest) -> Result<Submitted> {
        self.ensure_running()?;
        self.validate(&request)?;

        let state = &self.inner.state;
        let worker = self.pick_worker(request.target, &request.key);
        let op_id = request.op_id;
        let (ack_tx, ack_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        state.counters.submitted.fetch_add(1, Ordering::Relaxed);

        self.inner.inboxes[worker]
            .send(Request::Op(Envelope {
                request,
                ack: ack_tx,
                completion: completion_tx,
            }))
            .await
            .map_err(|_| Error::PoolClosed)?;

        let returned = ack_rx.await.map_err(|_| Error::PoolClosed)??;
        state.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(Submitted::new(
            op_id,
            worker,
            returned,
            Completion::new(completion_rx),
        ))
    }

    /// Wait until every request queued before this call has been processed
    /// by its worker.
    pub async fn drain(&self) -> Result<()> {
        self.ensure_running()?;
        let inner = self.inner.clone();
        let result = tokio::spawn(async move { inner.state.drain.run(&inner.inboxes).await })
            .await
            .map_err(|_| Error::PoolClosed)?;
        if result.is_ok() {
            self.inner
                .state
                .counters
                .drains
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Stop accepting requests and post an exit to every worker. Work already
    /// queued ahead of the exit still runs; await the returned handle to know
    /// when every worker has stopped.
    pub async fn shutdown(&self) -> Result<ShutdownHandle> {
        let previous = self.inner.lifecycle.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return Err(Error::PoolClosed);
        }
        self.inner
            .unstarted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        for inbox in &self.inner.inboxes {
            let _ = inbox.send(Request::Exit).await;
        }
        let workers = std::mem::take(&mut *self.workers());
        tracing::info!(workers = workers.len(), "worker pool shutting down");
        Ok(ShutdownHandle { workers })
    }

    /// Change the flush limit at runtime. Returns the limit after clamping.
    pub fn set_max_flushes_in_progress(&self, limit: usize) -> usize {
        let state = &self.inner.state;
        let limit = clamp_flush_limit("max_flushes_in_progress", limit, state.config.threads);
        state.flush_gate.set_limit(limit);
        limit
    }

    pub fn set_max_background_flushes_in_progress(&self, limit: usize) -> usize {
        let state = &self.inner.state;
        let limit = clamp_flush_limit(
            "max_background_flushes_in_progress",
            limit,
            state.config.threads,
        );
        state.background_flush_gate.set_limit(limit);
        limit
    }

    /// Forward a liveness report to the replicator.
    pub fn node_live(&self, node: NodeId, timestamp: u64) {
        if let Some(replicator) = self.inner.state.action.replicator() {
            replicator.node_live(node, timestamp);
        }
    }

    pub fn node_dead(&self, node: NodeId) {
        if let Some(replicator) = self.inner.state.action.replicator() {
            replicator.node_dead(node);
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.state.config
    }

    pub fn action(&self) -> &Arc<ActionState> {
        &self.inner.state.action
    }

    pub fn cache(&self) -> &Arc<ActionDir> {
        self.inner.state.action.cache()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let state = &self.inner.state;
        PoolStatsSnapshot {
            submitted: state.counters.submitted.load(Ordering::Relaxed),
            acknowledged: state.counters.acknowledged.load(Ordering::Relaxed),
            completed: state.counters.completed.load(Ordering::Relaxed),
            drains: state.counters.drains.load(Ordering::Relaxed),
            replication_fenced: state.action.is_fenced(),
            flush: state.flush_gate.snapshot(),
            background_flush: state.background_flush_gate.snapshot(),
            containers: state.action.stats.snapshot(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.inner.lifecycle.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            UNSTARTED => Err(Error::NotStarted),
            _ => Err(Error::PoolClosed),
        }
    }

    fn validate(&self, request: &AsyncRequest) -> Result<()> {
        let config = &self.inner.state.config;
        if request.key.is_empty() {
            return Err(Error::InvalidKey);
        }
        if request.key.len() > config.max_key_len {
            return Err(Error::KeyTooLong {
                len: request.key.len(),
                max: config.max_key_len,
            });
        }
        if let Payload::Inline(buffer) = &request.payload {
            if buffer.len() > config.max_object_size {
                return Err(Error::ObjectTooLarge {
                    len: buffer.len(),
                    max: config.max_object_size,
                });
            }
        }
        Ok(())
    }

    fn pick_worker(&self, target: Target, key: &[u8]) -> usize {
        let workers = self.inner.inboxes.len();
        match self.inner.state.config.dispatch {
            Dispatch::RoundRobin => self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % workers,
            Dispatch::KeyAffinity => {
                let mut hasher = DefaultHasher::new();
                target.hash(&mut hasher);
                key.hash(&mut hasher);
                (hasher.finish() % workers as u64) as usize
            }
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Join handles for every worker of a pool that is shutting down.
pub struct ShutdownHandle {
    workers: Vec<JoinHandle<()>>,
}

impl ShutdownHandle {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> anyhow::Result<()> {
        let mut failed = 0;
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "worker task join failed");
                failed += 1;
            }
        }
        anyhow::ensure!(failed == 0, "{failed} worker task(s) failed");
        Ok(())
    }
}
