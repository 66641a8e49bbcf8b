//! Per-container and pool-wide counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::gate::GateStats;
use crate::request::RequestKind;
use crate::types::ContainerId;

/// Failures are logged on the first occurrence and then every Nth.
pub const FAILURE_LOG_EVERY: u64 = 100;

pub(crate) fn should_log_failure(count: u64) -> bool {
    count == 1 || count % FAILURE_LOG_EVERY == 0
}

#[derive(Default)]
pub struct ContainerStats {
    puts: AtomicU64,
    writebacks: AtomicU64,
    flushes: AtomicU64,
    background_flushes: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
    replicated: AtomicU64,
    apply_failures: AtomicU64,
    replication_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStatsSnapshot {
    pub puts: u64,
    pub writebacks: u64,
    pub flushes: u64,
    pub background_flushes: u64,
    pub deletes: u64,
    pub bytes_written: u64,
    pub replicated: u64,
    pub apply_failures: u64,
    pub replication_failures: u64,
}

impl ContainerStats {
    pub(crate) fn record_applied(&self, kind: RequestKind, bytes: usize, deleted: bool) {
        let counter = match kind {
            RequestKind::Put => &self.puts,
            RequestKind::Writeback => &self.writebacks,
            RequestKind::Flush => &self.flushes,
            RequestKind::BackgroundFlush => &self.background_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if deleted {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_replicated(&self) {
        self.replicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running failure count.
    pub(crate) fn record_apply_failure(&self) -> u64 {
        self.apply_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the running failure count.
    pub(crate) fn record_replication_failure(&self) -> u64 {
        self.replication_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> ContainerStatsSnapshot {
        ContainerStatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            background_flushes: self.background_flushes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            replicated: self.replicated.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
        }
    }
}

/// Registry of container counters, shared by all workers.
#[derive(Default)]
pub struct StatsRegistry {
    containers: RwLock<HashMap<ContainerId, Arc<ContainerStats>>>,
}

impl StatsRegistry {
    pub fn container(&self, container: ContainerId) -> Arc<ContainerStats> {
        if let Some(stats) = self
            .containers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&container)
        {
            return stats.clone();
        }
        self.containers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(container)
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> BTreeMap<ContainerId, ContainerStatsSnapshot> {
        self.containers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, stats)| (*id, stats.snapshot()))
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) acknowledged: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) drains: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub submitted: u64,
    pub acknowledged: u64,
    pub completed: u64,
    pub drains: u64,
    pub replication_fenced: bool,
    pub flush: GateStats,
    pub background_flush: GateStats,
    pub containers: BTreeMap<ContainerId, ContainerStatsSnapshot>,
}

impl PoolStatsSnapshot {
    /// Sum of all container counters.
    pub fn totals(&self) -> ContainerStatsSnapshot {
        self.containers
            .values()
            .fold(ContainerStatsSnapshot::default(), |mut acc, s| {
                acc.puts += s.puts;
                acc.writebacks += s.writebacks;
                acc.flushes += s.flushes;
                acc.background_flushes += s.background_flushes;
                acc.deletes += s.deletes;
                acc.bytes_written += s.bytes_written;
                acc.replicated += s.replicated;
                acc.apply_failures += s.apply_failures;
                acc.replication_failures += s.replication_failures;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_logging_is_rate_limited() {
        let logged: Vec<u64> = (1..=250).filter(|n| should_log_failure(*n)).collect();
        assert_eq!(logged, vec![1, 100, 200]);
    }

    #[test]
    fn registry_returns_same_counters_per_container() {
        let registry = StatsRegistry::default();
        registry.container(7).record_applied(RequestKind::Put, 10, false);
        registry.container(7).record_applied(RequestKind::Flush, 0, true);
        registry.container(8).record_apply_failure();

        let snap = registry.snapshot();
        assert_eq!(snap[&7].puts, 1);
        assert_eq!(snap[&7].flushes, 1);
        assert_eq!(snap[&7].deletes, 1);
        assert_eq!(snap[&7].bytes_written, 10);
        assert_eq!(snap[&8].apply_failures, 1);
    }
}
