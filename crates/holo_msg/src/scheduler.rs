//! Periodic driver for response-map rollover and timeout detection.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::response_map::{lock_map, SharedResponseMap};

/// Ticks a shared response map at a fixed granularity.
pub struct TimeoutScheduler;

impl TimeoutScheduler {
    /// Spawn the tick loop. Runs until the handle is shut down or dropped.
    pub fn spawn(map: SharedResponseMap, tick: Duration) -> SchedulerHandle {
        let tick = tick.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let report = lock_map(&map).tick();
                        if report.expired > 0 {
                            tracing::debug!(
                                expired = report.expired,
                                rolled_over = report.rolled_over,
                                "response map expired trackers"
                            );
                        }
                    }
                }
            }
            Ok(())
        });
        SchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("timeout scheduler join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response_map::{shared, ResponseMap};
    use crate::types::{Endpoint, MessageError, TimeoutConfig};

    #[tokio::test(start_paused = true)]
    async fn scheduler_times_out_unanswered_requests() {
        let config = TimeoutConfig {
            reply_timeout: Duration::from_millis(200),
            tick: Duration::from_millis(20),
        };
        let map = shared(ResponseMap::new(config));
        let handle = TimeoutScheduler::spawn(map.clone(), config.tick);

        let (tx, rx) = tokio::sync::oneshot::channel();
        lock_map(&map).track(Endpoint::new(2, 1), Endpoint::new(1, 1), 0, tx);

        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timeout delivered")
            .expect("route alive");
        let waited = started.elapsed();

        assert!(matches!(result, Err(MessageError::Timeout { .. })));
        assert!(waited >= config.reply_timeout);
        assert!(waited <= config.reply_timeout * 2 + config.tick * 2);
        assert!(lock_map(&map).is_empty());

        handle.shutdown().await.unwrap();
    }
}
