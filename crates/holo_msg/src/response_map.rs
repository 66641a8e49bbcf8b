//! Correlation table for in-flight requests awaiting a reply.
//!
//! Every tracked request is stamped with the tick it was sent in and counted
//! in exactly one of six buckets defined by three interval markers
//! (`previous <= current <= next`):
//!
//! | Bucket | Stamp `t` |
//! |--------|-----------|
//! | `Pc`   | `t <= previous` (timeout candidates) |
//! | `Pa`   | `previous < t < current` |
//! | `Pn`   | `t == current` while `previous == current` (opening interval) |
//! | `C`    | `t == current` |
//! | `A`    | `current < t < next` |
//! | `N`    | `t >= next` |
//!
//! Once `current + timeout` has been reached the tick rolls the markers
//! forward in O(1) and folds the counters (`Pc += Pa + Pn + C`, `Pa = A`,
//! `C = N`). A full pass over the table only happens when `Pc > 0`, so the
//! steady-state cost of timeout detection is proportional to the requests that
//! actually time out, not to the number outstanding. A request is answered
//! with `Timeout` at most two intervals after it was sent.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::{Endpoint, MessageError, NodeId, ReplyResult, TimeoutConfig};

/// Local handle used to hand a reply (or a synthesized error) back to the caller.
pub type ReplyRoute = oneshot::Sender<ReplyResult>;

/// Opaque correlation key, safe to put on the wire.
///
/// Keys come from a per-map monotonic counter; their printable form is
/// lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseKey(u64);

impl ResponseKey {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid response key {0:?}")]
pub struct ParseResponseKeyError(String);

impl FromStr for ResponseKey {
    type Err = ParseResponseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseResponseKeyError(s.to_string()))
    }
}

/// Interval bucket a tracker is counted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    Pc,
    Pa,
    Pn,
    C,
    A,
    N,
}

/// Per-bucket tracker counts. Their sum always equals the table size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub pc: u64,
    pub pa: u64,
    pub pn: u64,
    pub c: u64,
    pub a: u64,
    pub n: u64,
}

impl BucketCounts {
    pub fn total(&self) -> u64 {
        self.pc + self.pa + self.pn + self.c + self.a + self.n
    }

    pub fn get(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::Pc => self.pc,
            Bucket::Pa => self.pa,
            Bucket::Pn => self.pn,
            Bucket::C => self.c,
            Bucket::A => self.a,
            Bucket::N => self.n,
        }
    }

    fn slot_mut(&mut self, bucket: Bucket) -> &mut u64 {
        match bucket {
            Bucket::Pc => &mut self.pc,
            Bucket::Pa => &mut self.pa,
            Bucket::Pn => &mut self.pn,
            Bucket::C => &mut self.c,
            Bucket::A => &mut self.a,
            Bucket::N => &mut self.n,
        }
    }
}

/// Interval markers, in ticks since the map's epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Markers {
    pub previous: u64,
    pub current: u64,
    pub next: u64,
}

/// Bucket assignment at insert time plus the rollover generation it was made in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Membership {
    generation: u64,
    bucket: Bucket,
}

/// Metadata for one in-flight request.
#[derive(Debug)]
pub struct ResponseTracker {
    key: ResponseKey,
    sent_at: Instant,
    stamp: u64,
    dest: Endpoint,
    src: Endpoint,
    seq: u64,
    route: ReplyRoute,
    membership: Membership,
}

impl ResponseTracker {
    pub fn key(&self) -> ResponseKey {
        self.key
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    pub fn dest(&self) -> Endpoint {
        self.dest
    }

    pub fn src(&self) -> Endpoint {
        self.src
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Hand the result to the local reply route. Returns false if the waiter is gone.
    pub fn complete(self, result: ReplyResult) -> bool {
        self.route.send(result).is_ok()
    }
}

/// Cumulative counters for monitoring and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseMapStats {
    pub tracked: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub node_dead: u64,
    pub rollovers: u64,
    /// Full-table passes made by the timeout detector.
    pub timeout_scans: u64,
    /// Full-table passes made for node-death notifications.
    pub node_dead_scans: u64,
}

/// Outcome of one scheduler tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rolled_over: bool,
    pub scanned: bool,
    pub expired: usize,
}

/// Hash table of in-flight trackers plus the interval bookkeeping.
///
/// All mutation goes through `&mut self`; cross-task use wraps it in a
/// `SharedResponseMap`.
#[derive(Debug)]
pub struct ResponseMap {
    trackers: HashMap<ResponseKey, ResponseTracker>,
    next_key: u64,
    epoch: Instant,
    tick: Duration,
    timeout_ticks: u64,
    generation: u64,
    markers: Markers,
    counts: BucketCounts,
    stats: ResponseMapStats,
}

impl ResponseMap {
    pub fn new(config: TimeoutConfig) -> Self {
        Self::with_epoch(config, Instant::now())
    }

    /// Build a map whose tick zero is `epoch`.
    pub fn with_epoch(config: TimeoutConfig, epoch: Instant) -> Self {
        let tick = config.tick.max(Duration::from_nanos(1));
        let timeout_ticks = config
            .reply_timeout
            .as_nanos()
            .div_ceil(tick.as_nanos())
            .clamp(1, u128::from(u64::MAX)) as u64;
        Self {
            trackers: HashMap::new(),
            next_key: 0,
            epoch,
            tick,
            timeout_ticks,
            generation: 0,
            markers: Markers {
                previous: 0,
                current: 0,
                next: timeout_ticks,
            },
            counts: BucketCounts::default(),
            stats: ResponseMapStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn counts(&self) -> BucketCounts {
        self.counts
    }

    pub fn markers(&self) -> Markers {
        self.markers
    }

    pub fn stats(&self) -> ResponseMapStats {
        self.stats
    }

    pub fn tick_granularity(&self) -> Duration {
        self.tick
    }

    pub fn timeout_ticks(&self) -> u64 {
        self.timeout_ticks
    }

    /// Whether `key` is still awaiting a reply.
    pub fn contains(&self, key: &ResponseKey) -> bool {
        self.trackers.contains_key(key)
    }

    /// Bucket `key` is currently counted in.
    pub fn bucket(&self, key: &ResponseKey) -> Option<Bucket> {
        self.trackers
            .get(key)
            .map(|tracker| self.bucket_of(tracker.membership))
    }

    /// Convert an instant into ticks since the epoch.
    pub fn stamp(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        (elapsed / self.tick.as_nanos()).min(u128::from(u64::MAX)) as u64
    }

    /// Start tracking a request sent now.
    pub fn track(
        &mut self,
        dest: Endpoint,
        src: Endpoint,
        seq: u64,
        route: ReplyRoute,
    ) -> ResponseKey {
        self.track_at(Instant::now(), dest, src, seq, route)
    }

    /// Start tracking a request sent at `now`.
    pub fn track_at(
        &mut self,
        now: Instant,
        dest: Endpoint,
        src: Endpoint,
        seq: u64,
        route: ReplyRoute,
    ) -> ResponseKey {
        self.next_key = self.next_key.wrapping_add(1);
        let key = ResponseKey(self.next_key);
        let stamp = self.stamp(now);
        let bucket = self.classify(stamp);
        *self.counts.slot_mut(bucket) += 1;
        self.stats.tracked += 1;
        self.trackers.insert(
            key,
            ResponseTracker {
                key,
                sent_at: now,
                stamp,
                dest,
                src,
                seq,
                route,
                membership: Membership {
                    generation: self.generation,
                    bucket,
                },
            },
        );
        key
    }

    /// Remove the tracker for `key` so the caller can route the real reply.
    ///
    /// `None` means the request already timed out, its node died, or the key
    /// was never issued here.
    pub fn resolve(&mut self, key: &ResponseKey) -> Option<ResponseTracker> {
        let tracker = self.trackers.remove(key)?;
        self.release_slot(tracker.membership);
        self.stats.resolved += 1;
        Some(tracker)
    }

    /// Run one scheduler tick at the current time.
    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Roll the interval markers if due, then expire timed-out trackers if
    /// the timeout-candidate bucket is non-empty.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let stamp = self.stamp(now);
        let mut report = TickReport::default();

        if stamp >= self.markers.current.saturating_add(self.timeout_ticks) {
            self.rollover(stamp);
            report.rolled_over = true;
        }

        if self.counts.pc > 0 {
            report.scanned = true;
            report.expired = self.expire(stamp);
        }
        report
    }

    /// Fail every tracker destined to `node` with `NodeDead`.
    pub fn on_node_dead(&mut self, node: NodeId) -> usize {
        self.stats.node_dead_scans += 1;
        let doomed: Vec<ResponseKey> = self
            .trackers
            .values()
            .filter(|tracker| tracker.dest.node == node)
            .map(|tracker| tracker.key)
            .collect();

        for key in &doomed {
            if let Some(tracker) = self.trackers.remove(key) {
                self.release_slot(tracker.membership);
                tracker.complete(Err(MessageError::NodeDead { node }));
            }
        }
        self.stats.node_dead += doomed.len() as u64;
        doomed.len()
    }

    /// Drop every tracker, answering each waiter with `Dropped`.
    pub fn clear(&mut self) -> usize {
        let drained = self.trackers.len();
        for (_, tracker) in self.trackers.drain() {
            tracker.complete(Err(MessageError::Dropped));
        }
        self.counts = BucketCounts::default();
        drained
    }

    fn classify(&self, stamp: u64) -> Bucket {
        let m = self.markers;
        if stamp == m.current && m.previous == m.current {
            Bucket::Pn
        } else if stamp <= m.previous {
            Bucket::Pc
        } else if stamp < m.current {
            Bucket::Pa
        } else if stamp == m.current {
            Bucket::C
        } else if stamp < m.next {
            Bucket::A
        } else {
            Bucket::N
        }
    }

    /// Bucket a tracker is counted in now, given where it was inserted and
    /// how many rollovers happened since.
    fn bucket_of(&self, membership: Membership) -> Bucket {
        match self.generation.saturating_sub(membership.generation) {
            0 => membership.bucket,
            1 => match membership.bucket {
                Bucket::A => Bucket::Pa,
                Bucket::N => Bucket::C,
                _ => Bucket::Pc,
            },
            _ => Bucket::Pc,
        }
    }

    fn release_slot(&mut self, membership: Membership) {
        let bucket = self.bucket_of(membership);
        let slot = self.counts.slot_mut(bucket);
        debug_assert!(*slot > 0, "response map bucket {bucket:?} underflow");
        if *slot == 0 {
            tracing::warn!(?bucket, "response map bucket underflow");
        }
        *slot = slot.saturating_sub(1);
    }

    fn rollover(&mut self, stamp: u64) {
        let old = self.counts;
        self.counts = BucketCounts {
            pc: old.pc + old.pa + old.pn + old.c,
            pa: old.a,
            pn: 0,
            c: old.n,
            a: 0,
            n: 0,
        };
        self.markers = Markers {
            previous: self.markers.current,
            current: stamp,
            next: stamp.saturating_add(self.timeout_ticks),
        };
        self.generation += 1;
        self.stats.rollovers += 1;
        tracing::trace!(
            previous = self.markers.previous,
            current = self.markers.current,
            candidates = self.counts.pc,
            "response map interval rollover"
        );
    }

    fn expire(&mut self, stamp: u64) -> usize {
        self.stats.timeout_scans += 1;
        let timeout_ticks = self.timeout_ticks;
        let expired: Vec<ResponseKey> = self
            .trackers
            .values()
            .filter(|tracker| stamp.saturating_sub(tracker.stamp) >= timeout_ticks)
            .map(|tracker| tracker.key)
            .collect();

        for key in &expired {
            if let Some(tracker) = self.trackers.remove(key) {
                self.release_slot(tracker.membership);
                let dest = tracker.dest;
                tracker.complete(Err(MessageError::Timeout { dest }));
            }
        }
        self.stats.timed_out += expired.len() as u64;
        expired.len()
    }
}

/// Response map shared between the scheduler, the correlator and inbox tasks.
pub type SharedResponseMap = Arc<Mutex<ResponseMap>>;

pub fn shared(map: ResponseMap) -> SharedResponseMap {
    Arc::new(Mutex::new(map))
}

/// Lock the shared map. A panic while holding the lock cannot leave the
/// counters half-updated across an await, so poisoning is ignored.
pub fn lock_map(map: &SharedResponseMap) -> MutexGuard<'_, ResponseMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);
    const TIMEOUT: Duration = Duration::from_millis(100);

    fn config() -> TimeoutConfig {
        TimeoutConfig {
            reply_timeout: TIMEOUT,
            tick: TICK,
        }
    }

    fn ep(node: NodeId) -> Endpoint {
        Endpoint::new(node, 7)
    }

    fn at(epoch: Instant, ticks: u32) -> Instant {
        epoch + TICK * ticks
    }

    fn track(
        map: &mut ResponseMap,
        now: Instant,
        node: NodeId,
    ) -> (ResponseKey, oneshot::Receiver<ReplyResult>) {
        let (tx, rx) = oneshot::channel();
        let key = map.track_at(now, ep(node), ep(1), 0, tx);
        (key, rx)
    }

    fn assert_counts_match(map: &ResponseMap) {
        assert_eq!(map.counts().total(), map.len() as u64, "{:?}", map.counts());
    }

    #[test]
    fn key_printable_form_parses_back() {
        let key = ResponseKey::from_raw(0xdead_beef);
        assert_eq!(key.to_string(), "deadbeef");
        assert_eq!("deadbeef".parse::<ResponseKey>().unwrap(), key);
        assert!("not-hex".parse::<ResponseKey>().is_err());
    }

    #[test]
    fn track_then_resolve_returns_same_tracker() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let (tx, _rx) = oneshot::channel();
        let key = map.track_at(at(epoch, 3), ep(2), ep(1), 42, tx);
        assert_eq!(map.len(), 1);

        let tracker = map.resolve(&key).expect("tracker present");
        assert_eq!(tracker.key(), key);
        assert_eq!(tracker.dest(), ep(2));
        assert_eq!(tracker.src(), ep(1));
        assert_eq!(tracker.seq(), 42);
        assert!(map.is_empty());
        assert_eq!(map.counts(), BucketCounts::default());
        assert!(map.resolve(&key).is_none());
    }

    #[test]
    fn keys_are_unique_and_monotonic() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let (a, _ra) = track(&mut map, epoch, 2);
        let (b, _rb) = track(&mut map, epoch, 2);
        assert!(b > a);
    }

    #[test]
    fn classification_follows_markers() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let (opening, _r0) = track(&mut map, epoch, 2);
        assert_eq!(map.bucket(&opening), Some(Bucket::Pn));
        let (active, _r1) = track(&mut map, at(epoch, 4), 2);
        assert_eq!(map.bucket(&active), Some(Bucket::A));
        let (next, _r2) = track(&mut map, at(epoch, 10), 2);
        assert_eq!(map.bucket(&next), Some(Bucket::N));
        assert_counts_match(&map);

        // Roll over at tick 10: previous=0, current=10, next=20.
        let report = map.tick_at(at(epoch, 10));
        assert!(report.rolled_over);
        assert_eq!(
            map.markers(),
            Markers {
                previous: 0,
                current: 10,
                next: 20
            }
        );
        // The opening tracker was sent 10 ticks ago and is expired right away.
        assert_eq!(report.expired, 1);
        assert!(!map.contains(&opening));
        assert_eq!(map.bucket(&active), Some(Bucket::Pa));
        assert_eq!(map.bucket(&next), Some(Bucket::C));

        let (c, _r3) = track(&mut map, at(epoch, 10), 2);
        assert_eq!(map.bucket(&c), Some(Bucket::C));
        let (a, _r4) = track(&mut map, at(epoch, 15), 2);
        assert_eq!(map.bucket(&a), Some(Bucket::A));
        assert_counts_match(&map);
    }

    #[test]
    fn rollover_folds_counters() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let _k: Vec<_> = (1..9).map(|t| track(&mut map, at(epoch, t), 2)).collect();
        let _n = track(&mut map, at(epoch, 12), 2);
        let before = map.counts();
        assert_eq!(before.a, 8);
        assert_eq!(before.n, 1);

        let report = map.tick_at(at(epoch, 12));
        assert!(report.rolled_over);
        let after = map.counts();
        assert_eq!(after.pa, 8);
        assert_eq!(after.c, 1);
        assert_eq!(after.pc + after.pn + after.a + after.n, 0);
        assert!(!report.scanned);
        assert_counts_match(&map);
    }

    #[test]
    fn every_expired_tracker_gets_exactly_one_timeout() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let mut waiters = Vec::new();
        for t in 0..25u32 {
            waiters.push((t, track(&mut map, at(epoch, t), 3)));
        }

        let mut delivered_at = HashMap::new();
        for now in 0..60u32 {
            map.tick_at(at(epoch, now));
            assert_counts_match(&map);
            for (sent, (key, rx)) in waiters.iter_mut() {
                if let Ok(result) = rx.try_recv() {
                    assert!(matches!(result, Err(MessageError::Timeout { .. })));
                    assert!(delivered_at.insert(*key, now).is_none());
                    // Never early, and never later than two intervals.
                    assert!(now - *sent >= 10, "sent {sent} expired {now}");
                    assert!(now - *sent <= 20, "sent {sent} expired {now}");
                }
            }
        }
        assert_eq!(delivered_at.len(), waiters.len());
        assert!(map.is_empty());
        assert_eq!(map.stats().timed_out, 25);
    }

    #[test]
    fn resolved_trackers_are_never_timed_out() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let (key, mut rx) = track(&mut map, at(epoch, 2), 4);
        let tracker = map.resolve(&key).unwrap();
        for now in 0..40 {
            map.tick_at(at(epoch, now));
        }
        assert_eq!(map.stats().timed_out, 0);
        drop(tracker);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tick_without_candidates_skips_the_scan() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let mut waiters = Vec::with_capacity(100_000);
        for _ in 0..100_000 {
            waiters.push(track(&mut map, at(epoch, 1), 5));
        }
        assert_eq!(map.counts().pc, 0);

        for now in 1..10 {
            let report = map.tick_at(at(epoch, now));
            assert!(!report.scanned);
        }
        assert_eq!(map.stats().timeout_scans, 0);

        // First rollover moves them to previous-active; still nothing to scan.
        let report = map.tick_at(at(epoch, 10));
        assert!(report.rolled_over);
        assert!(!report.scanned);
        assert_eq!(map.stats().timeout_scans, 0);

        // Second rollover makes them candidates: one pass expires all of them.
        let report = map.tick_at(at(epoch, 20));
        assert!(report.scanned);
        assert_eq!(report.expired, 100_000);
        assert_eq!(map.stats().timeout_scans, 1);
        assert!(map.is_empty());
    }

    #[test]
    fn node_death_only_fails_trackers_for_that_node() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let mut dead = Vec::new();
        let mut alive = Vec::new();
        for i in 0..10 {
            dead.push(track(&mut map, at(epoch, i), 9));
            alive.push(track(&mut map, at(epoch, i), 8));
        }

        assert_eq!(map.on_node_dead(9), 10);
        assert_eq!(map.len(), 10);
        assert_counts_match(&map);
        for (key, rx) in dead.iter_mut() {
            assert!(!map.contains(key));
            assert_eq!(
                rx.try_recv().unwrap(),
                Err(MessageError::NodeDead { node: 9 })
            );
        }
        for (key, rx) in alive.iter_mut() {
            assert!(map.contains(key));
            assert!(rx.try_recv().is_err());
        }

        // A second notification finds nothing left to fail.
        assert_eq!(map.on_node_dead(9), 0);
    }

    #[test]
    fn clear_answers_waiters_with_dropped() {
        let epoch = Instant::now();
        let mut map = ResponseMap::with_epoch(config(), epoch);
        let (_key, mut rx) = track(&mut map, epoch, 2);
        assert_eq!(map.clear(), 1);
        assert_eq!(rx.try_recv().unwrap(), Err(MessageError::Dropped));
        assert_eq!(map.counts().total(), 0);
    }
}
