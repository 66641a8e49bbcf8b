//! Bounded-token admission control for flushes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;

/// Caps the number of flushes applying at once.
///
/// Tokens are counted with atomics so workers on different runtime threads
/// can acquire and release without a lock. Lowering the limit never revokes
/// tokens already held; new acquisitions wait until the count drops below it.
pub struct FlowControlGate {
    name: &'static str,
    limit: AtomicUsize,
    in_progress: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    waits: AtomicU64,
    notify: Notify,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub limit: usize,
    pub in_progress: usize,
    pub peak: usize,
    pub acquired: u64,
    /// Acquisitions that had to wait for a token.
    pub waits: u64,
}

impl FlowControlGate {
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit: AtomicUsize::new(limit.max(1)),
            in_progress: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Wait for a token.
    pub async fn acquire(self: &Arc<Self>) -> FlushToken {
        let mut waited = false;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not lost.
            notified.as_mut().enable();

            if let Some(token) = self.try_acquire_inner() {
                if waited {
                    self.waits.fetch_add(1, Ordering::Relaxed);
                }
                return token;
            }
            waited = true;
            notified.await;
        }
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlushToken> {
        self.try_acquire_inner()
    }

    fn try_acquire_inner(self: &Arc<Self>) -> Option<FlushToken> {
        loop {
            let limit = self.limit.load(Ordering::Acquire).max(1);
            let current = self.in_progress.load(Ordering::Acquire);
            if current >= limit {
                return None;
            }
            if self
                .in_progress
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak.fetch_max(current + 1, Ordering::Relaxed);
                self.acquired.fetch_add(1, Ordering::Relaxed);
                return Some(FlushToken { gate: self.clone() });
            }
        }
    }

    fn release(&self) {
        let prev = self.in_progress.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "{} gate released more tokens than acquired", self.name);
        self.notify.notify_one();
    }

    /// Change the limit. Returns true if it changed.
    pub fn set_limit(&self, limit: usize) -> bool {
        let limit = limit.max(1);
        let prev = self.limit.swap(limit, Ordering::AcqRel);
        if prev != limit {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> GateStats {
        GateStats {
            limit: self.limit(),
            in_progress: self.in_progress(),
            peak: self.peak.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

/// Held while a flush applies; returns the token on drop.
pub struct FlushToken {
    gate: Arc<FlowControlGate>,
}

impl FlushToken {
    pub fn gate(&self) -> &FlowControlGate {
        &self.gate
    }
}

impl Drop for FlushToken {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn try_acquire_respects_limit() {
        let gate = Arc::new(FlowControlGate::new("flush", 2));
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.snapshot().peak, 2);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let gate = Arc::new(FlowControlGate::new("flush", 1));
        let held = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _token = gate.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        assert_eq!(gate.in_progress(), 0);
        assert_eq!(gate.snapshot().waits, 1);
    }

    #[tokio::test]
    async fn raising_limit_releases_waiters() {
        let gate = Arc::new(FlowControlGate::new("background-flush", 1));
        let _held = gate.acquire().await;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.set_limit(2));
        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        assert_eq!(gate.in_progress(), 2);
        drop(token);
        assert!(!gate.set_limit(2));
    }

    #[test]
    fn lowering_limit_keeps_held_tokens() {
        let gate = Arc::new(FlowControlGate::new("flush", 3));
        let held: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        gate.set_limit(1);
        assert_eq!(gate.in_progress(), 3);
        assert!(gate.try_acquire().is_none());
        drop(held);
        assert!(gate.try_acquire().is_some());
    }
}
