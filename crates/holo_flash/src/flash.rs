//! Local flash backends.
//!
//! The worker pool only needs a narrow "apply object mutation" call per
//! request kind. `MemFlash` keeps objects in memory; `FjallFlash` stores them
//! in a fjall partition.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

use crate::types::{ObjectMeta, Target};

/// Failure codes reported by the flash layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FlashStatus {
    #[error("out of space")]
    OutOfSpace,
    #[error("object not found")]
    NotFound,
    #[error("busy")]
    Busy,
    #[error("i/o error: {0}")]
    Io(String),
}

/// Object mutation interface used by the workers. `data == None` deletes.
#[async_trait]
pub trait FlashStore: Send + Sync + 'static {
    async fn put(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus>;

    /// Demote a dirty cached copy.
    async fn writeback(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        self.put(target, key, data, meta).await
    }

    /// Force an entry to stable storage.
    async fn flush(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        self.put(target, key, data, meta).await
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus>;
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<(Target, Vec<u8>), (ObjectMeta, Vec<u8>)>,
    bytes: usize,
}

/// In-memory flash with an optional capacity limit.
#[derive(Default)]
pub struct MemFlash {
    state: Mutex<MemState>,
    capacity: Option<usize>,
}

impl MemFlash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail puts with `OutOfSpace` once stored data would exceed `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            capacity: Some(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_used(&self) -> usize {
        self.lock().bytes
    }

    pub fn meta(&self, target: Target, key: &[u8]) -> Option<ObjectMeta> {
        self.lock()
            .objects
            .get(&(target, key.to_vec()))
            .map(|(meta, _)| *meta)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FlashStore for MemFlash {
    async fn put(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        let mut state = self.lock();
        let slot = (target, key.to_vec());
        match data {
            None => {
                let (_, old) = state.objects.remove(&slot).ok_or(FlashStatus::NotFound)?;
                state.bytes -= old.len();
            }
            Some(data) => {
                let replaced = state.objects.get(&slot).map_or(0, |(_, old)| old.len());
                let after = state.bytes - replaced + data.len();
                if self.capacity.is_some_and(|cap| after > cap) {
                    return Err(FlashStatus::OutOfSpace);
                }
                state.objects.insert(slot, (meta, data.to_vec()));
                state.bytes = after;
            }
        }
        Ok(())
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus> {
        Ok(self
            .lock()
            .objects
            .get(&(target, key.to_vec()))
            .map(|(_, data)| data.clone()))
    }
}

/// Flash backend on a fjall keyspace.
pub struct FjallFlash {
    keyspace: Keyspace,
    objects: fjall::PartitionHandle,
}

impl FjallFlash {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref()).open()?;
        let objects = keyspace.open_partition("flash_objects", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, objects })
    }

    /// Run a partition write, and optionally a sync, on the blocking pool.
    async fn apply(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
        persist: bool,
    ) -> Result<(), FlashStatus> {
        let objects = self.objects.clone();
        let keyspace = self.keyspace.clone();
        let object_key = encode_object_key(target, key);
        let value = data.map(|data| encode_object_value(meta, data));
        tokio::task::spawn_blocking(move || {
            write_object(&objects, object_key, value)?;
            if persist {
                keyspace
                    .persist(PersistMode::SyncAll)
                    .map_err(|err| FlashStatus::Io(err.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|err| FlashStatus::Io(format!("flash write task failed: {err}")))?
    }
}

fn write_object(
    objects: &fjall::PartitionHandle,
    object_key: Vec<u8>,
    value: Option<Vec<u8>>,
) -> Result<(), FlashStatus> {
    match value {
        Some(value) => objects
            .insert(object_key, value)
            .map_err(|err| FlashStatus::Io(err.to_string())),
        None => {
            let existing = objects
                .get(&object_key)
                .map_err(|err| FlashStatus::Io(err.to_string()))?;
            if existing.is_none() {
                return Err(FlashStatus::NotFound);
            }
            objects
                .remove(object_key)
                .map_err(|err| FlashStatus::Io(err.to_string()))
        }
    }
}

#[async_trait]
impl FlashStore for FjallFlash {
    async fn put(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        self.apply(target, key, data, meta, false).await
    }

    async fn flush(
        &self,
        target: Target,
        key: &[u8],
        data: Option<&[u8]>,
        meta: ObjectMeta,
    ) -> Result<(), FlashStatus> {
        self.apply(target, key, data, meta, true).await
    }

    async fn get(&self, target: Target, key: &[u8]) -> Result<Option<Vec<u8>>, FlashStatus> {
        let Some(bytes) = self
            .objects
            .get(encode_object_key(target, key))
            .map_err(|err| FlashStatus::Io(err.to_string()))?
        else {
            return Ok(None);
        };
        decode_object_value(&bytes)
            .map(|(_, data)| Some(data))
            .map_err(|err| FlashStatus::Io(err.to_string()))
    }
}

fn encode_object_key(target: Target, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len());
    out.extend_from_slice(&target.container.to_be_bytes());
    out.extend_from_slice(&target.shard.to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn encode_object_value(meta: ObjectMeta, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + 4 + data.len());
    out.extend_from_slice(&meta.expiry.to_be_bytes());
    out.extend_from_slice(&meta.flags.to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn decode_object_value(data: &[u8]) -> anyhow::Result<(ObjectMeta, Vec<u8>)> {
    let mut offset = 0;
    let expiry = read_u64(data, &mut offset)?;
    let flags = read_u32(data, &mut offset)?;
    let len = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(offset + len <= data.len(), "short object value");
    Ok((
        ObjectMeta { expiry, flags },
        data[offset..offset + len].to_vec(),
    ))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    const T: Target = Target::new(1, 0);

    #[tokio::test]
    async fn mem_flash_enforces_capacity() {
        let flash = MemFlash::with_capacity(8);
        flash.put(T, b"a", Some(b"12345"), ObjectMeta::default()).await.unwrap();
        assert_eq!(
            flash.put(T, b"b", Some(b"12345"), ObjectMeta::default()).await,
            Err(FlashStatus::OutOfSpace)
        );
        // Overwriting in place only counts the difference.
        flash.put(T, b"a", Some(b"12345678"), ObjectMeta::default()).await.unwrap();
        assert_eq!(flash.bytes_used(), 8);
    }

    #[tokio::test]
    async fn mem_flash_delete_of_missing_object_is_not_found() {
        let flash = MemFlash::new();
        assert_eq!(
            flash.put(T, b"gone", None, ObjectMeta::default()).await,
            Err(FlashStatus::NotFound)
        );
    }

    #[tokio::test]
    async fn fjall_flash_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let meta = ObjectMeta {
            expiry: 99,
            flags: 3,
        };
        {
            let flash = FjallFlash::open(dir.path()).unwrap();
            flash.flush(T, b"k1", Some(b"v1"), meta).await.unwrap();
            flash.put(T, b"k2", Some(b"v2"), meta).await.unwrap();
            flash.flush(T, b"k2", None, meta).await.unwrap();
        }

        let flash = FjallFlash::open(dir.path()).unwrap();
        assert_eq!(flash.get(T, b"k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(flash.get(T, b"k2").await.unwrap(), None);
        assert_eq!(flash.get(Target::new(2, 0), b"k1").await.unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fjall_writes_leave_the_runtime_free() {
        let dir = tempfile::tempdir().unwrap();
        let flash = Arc::new(FjallFlash::open(dir.path()).unwrap());

        // On a single-threaded runtime other tasks only run if the writes
        // yield instead of blocking the thread.
        let ticks = Arc::new(AtomicU32::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                while ticks.fetch_add(1, Ordering::Relaxed) < 16 {
                    tokio::task::yield_now().await;
                }
            }
        });
        let writes = (0..16u8).map(|i| {
            let flash = flash.clone();
            async move {
                flash
                    .writeback(T, &[i], Some(&[i; 64]), ObjectMeta::default())
                    .await
            }
        });
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }
        assert!(ticks.load(Ordering::Relaxed) > 0);
        ticker.await.unwrap();

        flash.put(T, &[3], None, ObjectMeta::default()).await.unwrap();
        assert_eq!(flash.get(T, &[3]).await.unwrap(), None);
        assert_eq!(flash.get(T, &[4]).await.unwrap(), Some(vec![4; 64]));
        assert_eq!(
            flash.put(T, &[3], None, ObjectMeta::default()).await,
            Err(FlashStatus::NotFound)
        );
    }

    #[test]
    fn object_value_rejects_truncation() {
        let encoded = encode_object_value(ObjectMeta::default(), b"payload");
        assert!(decode_object_value(&encoded[..encoded.len() - 1]).is_err());
        let (_, data) = decode_object_value(&encoded).unwrap();
        assert_eq!(data, b"payload");
    }
}
