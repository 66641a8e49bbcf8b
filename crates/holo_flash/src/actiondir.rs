//! Object cache the write path copies payloads out of.
//!
//! Entries are shared `Arc`s guarded by their own `RwLock`; an entry may be
//! evicted while a request that references it is still queued, which is why
//! workers copy the bytes out before acknowledging. The directory also owns
//! the flush-token gates the worker pool draws from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{DEFAULT_MAX_BG_FLUSHES, DEFAULT_MAX_FLUSHES};
use crate::error::{Error, Result};
use crate::gate::FlowControlGate;
use crate::types::{ObjectMeta, Target};

/// Cached copy of one object. `data == None` is a pending delete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedObject {
    pub data: Option<Vec<u8>>,
    pub meta: ObjectMeta,
    pub dirty: bool,
    /// Bumped on every modification.
    pub version: u64,
}

#[derive(Debug)]
pub struct CacheEntry {
    target: Target,
    key: Vec<u8>,
    state: RwLock<CachedObject>,
    /// Set while a background flush for this entry is queued.
    claimed: AtomicBool,
}

pub type CacheRef = Arc<CacheEntry>;

impl CacheEntry {
    fn new(target: Target, key: Vec<u8>) -> Self {
        Self {
            target,
            key,
            state: RwLock::new(CachedObject::default()),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, CachedObject> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CachedObject> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Overwrite the cached bytes in place. Visible to later copies only.
    pub fn update(&self, data: Option<Vec<u8>>, meta: ObjectMeta) {
        let mut state = self.write();
        state.data = data;
        state.meta = meta;
        state.dirty = true;
        state.version += 1;
    }

    /// Clear the dirty bit if nothing changed since `version` was copied.
    pub fn mark_clean(&self, version: u64) -> bool {
        let mut state = self.write();
        if state.version == version && state.dirty {
            state.dirty = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the entry only if it is still dirty once the claim is held. A
    /// flush marks its entry clean before releasing, so a claim won right
    /// after a release sees the clean bit.
    fn try_claim_dirty(&self) -> bool {
        if !self.try_claim() {
            return false;
        }
        if self.is_dirty() {
            true
        } else {
            self.release_claim();
            false
        }
    }
}

pub struct ActionDir {
    entries: Mutex<HashMap<(Target, Vec<u8>), CacheRef>>,
    max_object_size: usize,
    flush_gate: Arc<FlowControlGate>,
    background_flush_gate: Arc<FlowControlGate>,
}

impl ActionDir {
    pub fn new(max_object_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_object_size,
            flush_gate: Arc::new(FlowControlGate::new("flush", DEFAULT_MAX_FLUSHES)),
            background_flush_gate: Arc::new(FlowControlGate::new(
                "background-flush",
                DEFAULT_MAX_BG_FLUSHES,
            )),
        }
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    pub fn flush_gate(&self) -> &Arc<FlowControlGate> {
        &self.flush_gate
    }

    pub fn background_flush_gate(&self) -> &Arc<FlowControlGate> {
        &self.background_flush_gate
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite an object and mark it dirty.
    pub fn upsert(
        &self,
        target: Target,
        key: &[u8],
        data: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<CacheRef> {
        if data.len() > self.max_object_size {
            return Err(Error::ObjectTooLarge {
                len: data.len(),
                max: self.max_object_size,
            });
        }
        let entry = self
            .entries()
            .entry((target, key.to_vec()))
            .or_insert_with(|| Arc::new(CacheEntry::new(target, key.to_vec())))
            .clone();
        entry.update(Some(data), meta);
        Ok(entry)
    }

    /// Turn a cached object into a dirty delete marker.
    pub fn remove(&self, target: Target, key: &[u8]) -> Option<CacheRef> {
        let entry = self.get(target, key)?;
        let meta = entry.read().meta;
        entry.update(None, meta);
        Some(entry)
    }

    pub fn get(&self, target: Target, key: &[u8]) -> Option<CacheRef> {
        self.entries().get(&(target, key.to_vec())).cloned()
    }

    /// Drop an entry from the directory. References already handed out stay valid.
    pub fn evict(&self, target: Target, key: &[u8]) -> Option<CacheRef> {
        self.entries().remove(&(target, key.to_vec()))
    }

    pub fn dirty_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.is_dirty())
            .count()
    }

    /// Claim up to `limit` dirty entries for background flushing. An entry
    /// stays claimed until its flush completes, so a scan never queues it twice.
    pub fn claim_dirty(&self, limit: usize) -> Vec<CacheRef> {
        let candidates: Vec<CacheRef> = self
            .entries()
            .values()
            .filter(|entry| entry.is_dirty())
            .cloned()
            .collect();
        candidates
            .into_iter()
            .filter(|entry| entry.try_claim_dirty())
            .take(limit)
            .collect()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(Target, Vec<u8>), CacheRef>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
