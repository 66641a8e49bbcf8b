//! All-worker drain barrier.
//!
//! A drain registers one ticket per worker on a shared registration channel,
//! then queues a `Drain` marker behind whatever each worker already has. A
//! worker that reaches the marker pops a ticket and posts to the issuer's
//! completion channel. The issuer returns after one post per worker, so every
//! request queued before the drain has finished by then.
//!
//! The barrier lock is held for the entire drain. Two drains therefore never
//! have tickets registered at the same time and cannot satisfy each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::request::Request;

struct DrainTicket {
    generation: u64,
    done: mpsc::Sender<usize>,
}

pub struct DrainBarrier {
    /// Serializes drains; holds the last generation issued.
    lock: tokio::sync::Mutex<u64>,
    register_tx: mpsc::UnboundedSender<DrainTicket>,
    register_rx: Mutex<mpsc::UnboundedReceiver<DrainTicket>>,
    completed: AtomicU64,
}

impl Default for DrainBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainBarrier {
    pub fn new() -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        Self {
            lock: tokio::sync::Mutex::new(0),
            register_tx,
            register_rx: Mutex::new(register_rx),
            completed: AtomicU64::new(0),
        }
    }

    /// Drains completed so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Issue a drain across `inboxes` and wait for every worker to reach it.
    ///
    /// Callers run this in its own task: abandoning it halfway would leave
    /// tickets registered for markers that were never queued.
    pub(crate) async fn run(&self, inboxes: &[mpsc::Sender<Request>]) -> Result<()> {
        let mut last = self.lock.lock().await;
        *last += 1;
        let generation = *last;
        let workers = inboxes.len();

        let (done_tx, mut done_rx) = mpsc::channel(workers.max(1));
        for _ in 0..workers {
            self.register_tx
                .send(DrainTicket {
                    generation,
                    done: done_tx.clone(),
                })
                .map_err(|_| Error::PoolClosed)?;
        }
        drop(done_tx);

        let mut queued = 0;
        for inbox in inboxes {
            if inbox.send(Request::Drain { generation }).await.is_err() {
                break;
            }
            queued += 1;
        }

        let mut arrived = 0;
        while arrived < queued {
            if done_rx.recv().await.is_none() {
                break;
            }
            arrived += 1;
        }

        if queued < workers {
            // Markers that could not be queued leave their tickets behind.
            let mut rx = self.registrations();
            while rx.try_recv().is_ok() {}
            tracing::debug!(generation, queued, workers, "drain aborted, pool closed");
            return Err(Error::PoolClosed);
        }

        self.completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(generation, workers, "drain complete");
        Ok(())
    }

    /// Called by a worker that dequeued `Drain { generation }`.
    ///
    /// A missing or mismatched ticket means the barrier protocol was broken;
    /// continuing would hang or cross-satisfy drains, so it is fatal.
    pub(crate) fn arrive(&self, worker: usize, generation: u64) {
        let ticket = self.registrations().try_recv();
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(err) => panic!(
                "drain barrier: worker {worker} found no ticket for generation {generation}: {err}"
            ),
        };
        assert_eq!(
            ticket.generation, generation,
            "drain barrier: worker {worker} popped a ticket from another drain"
        );
        if ticket.done.try_send(worker).is_err() {
            panic!("drain barrier: issuer of generation {generation} is gone");
        }
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, mpsc::UnboundedReceiver<DrainTicket>> {
        self.register_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
