#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use holo_flash::{
    ActionDir, ActionState, AsyncPool, FlashStatus, FlashStore, MemFlash, ObjectMeta, PoolConfig,
    Target,
};
use tokio::sync::Semaphore;

pub const T: Target = Target::new(1, 0);

pub fn config(threads: usize) -> PoolConfig {
    PoolConfig {
        threads,
        max_key_len: 64,
        max_object_size: 4096,
        queue_depth: 1024,
        ..PoolConfig::default()
    }
}

/// Memory flash that counts applies and can slow each one down.
#[derive(Default)]
pub struct RecordingFlash {
    pub inner: MemFlash,
    pub applied: AtomicU64,
    pub delay: Duration,
}

impl RecordingFlash {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlashStore for RecordingFlash {
    async fn put(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = self.inner.put(target, key, data, meta).await;
        self.applied.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus> {
        self.inner.get(target, key).await
    }
}

/// Flash whose flushes block until the test hands out permits, while
/// tracking how many flushes are inside the apply step at once.
pub struct GatedFlash {
    pub inner: MemFlash,
    pub permits: Semaphore,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub flushed: AtomicU64,
}

impl GatedFlash {
    pub fn new() -> Self {
        Self {
            inner: MemFlash::new(),
            permits: Semaphore::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    /// Let every flush through from now on.
    pub fn open(&self) {
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl FlashStore for GatedFlash {
    async fn put(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        self.inner.put(target, key, data, meta).await
    }

    async fn flush(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FlashStatus::Busy)?;
        permit.forget();
        let result = self.inner.put(target, key, data, meta).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.flushed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus> {
        self.inner.get(target, key).await
    }
}

/// Build and start a pool over `flash`.
pub async fn start_pool(config: PoolConfig, flash: Arc<dyn FlashStore>) -> AsyncPool {
    let cache = Arc::new(ActionDir::new(config.max_object_size));
    let action = Arc::new(ActionState::new(flash, cache));
    let pool = AsyncPool::alloc(config, action).expect("alloc pool");
    pool.start().await.expect("start pool");
    pool
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
