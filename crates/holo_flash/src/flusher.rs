//! Scanner that turns dirty cache entries into background flushes.

use std::time::Duration;

use crate::error::Error;
use crate::pool::AsyncPool;
use crate::request::AsyncRequest;

/// Idle back-off stops growing at this multiple of the sleep floor.
pub const MAX_IDLE_BACKOFF: u32 = 32;
/// Entries claimed per scan.
pub const DEFAULT_BATCH: usize = 256;

pub struct BackgroundFlusher;

impl BackgroundFlusher {
    /// Start scanning. The pool must already be started.
    pub fn spawn(pool: AsyncPool, batch: usize) -> FlusherHandle {
        let floor = pool
            .config()
            .background_flush_sleep_floor
            .max(Duration::from_millis(1));
        let batch = batch.max(1);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut delay = floor;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match flush_pass(&pool, batch).await {
                    Ok(0) => delay = (delay * 2).min(floor * MAX_IDLE_BACKOFF),
                    Ok(queued) => {
                        tracing::debug!(queued, "background flush pass");
                        delay = floor;
                    }
                    Err(Error::PoolClosed) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "background flush pass failed");
                        delay = floor;
                    }
                }
            }
            Ok(())
        });
        FlusherHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Queue a background flush for each claimed dirty entry.
async fn flush_pass(pool: &AsyncPool, batch: usize) -> Result<usize, Error> {
    let entries = pool.cache().claim_dirty(batch);
    let mut queued = 0;
    let mut pending = entries.into_iter();
    while let Some(entry) = pending.next() {
        match pool.submit(AsyncRequest::background_flush(entry.clone())).await {
            Ok(_) => queued += 1,
            Err(err) => {
                entry.release_claim();
                for rest in pending {
                    rest.release_claim();
                }
                return Err(err);
            }
        }
    }
    Ok(queued)
}

pub struct FlusherHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl FlusherHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("background flusher join failed: {err}")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
