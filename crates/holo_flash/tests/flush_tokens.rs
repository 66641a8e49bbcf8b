mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{config, start_pool, T};
use holo_flash::{
    AsyncRequest, FlashStatus, FlashStore, MemFlash, ObjectMeta, Payload, RequestKind, Target,
};
use proptest::prelude::*;

/// Records the highest number of flushes applying at the same time.
#[derive(Default)]
struct ConcurrencyFlash {
    inner: MemFlash,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl FlashStore for ConcurrencyFlash {
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
        tokio::time::sleep(Duration::from_micros(200 + (key[0] as u64 % 5) * 300)).await;
        let result = self.inner.put(target, key, data, meta).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus> {
        self.inner.get(target, key).await
    }
}

fn run_flushes(threads: usize, limit: usize, background: bool, flushes: usize, submitters: usize) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let flash = Arc::new(ConcurrencyFlash::default());
        let mut cfg = config(threads);
        cfg.max_flushes_in_progress = limit;
        cfg.max_background_flushes_in_progress = limit;
        let pool = start_pool(cfg, flash.clone()).await;
        let kind = if background {
            RequestKind::BackgroundFlush
        } else {
            RequestKind::Flush
        };

        let mut tasks = Vec::new();
        for submitter in 0..submitters {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut completions = Vec::new();
                for i in (submitter..flushes).step_by(submitters) {
                    let key = vec![i as u8, submitter as u8];
                    let request = AsyncRequest::new(kind, T, key, Payload::Inline(vec![1; 16]));
                    completions.push(pool.submit(request).await.unwrap().into_completion());
                }
                for completion in completions {
                    completion.wait().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let allowed = limit.clamp(1, threads);
        let stats = pool.stats();
        let gate = if background {
            stats.background_flush
        } else {
            stats.flush
        };
        assert!(flash.peak.load(Ordering::SeqCst) <= allowed);
        assert!(gate.peak <= allowed);
        assert_eq!(gate.in_progress, 0);
        let totals = stats.totals();
        let counted = if background {
            totals.background_flushes
        } else {
            totals.flushes
        };
        assert_eq!(counted, flushes as u64);
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_flushes_never_exceed_the_token_limit(
        threads in 1usize..6,
        limit in 0usize..10,
        background in any::<bool>(),
        flushes in 1usize..24,
        submitters in 1usize..4,
    ) {
        run_flushes(threads, limit, background, flushes, submitters);
    }
}
