// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! A small ordered key-value store holding all tablet metadata.
//!
//! Every batch is appended to a JSON stream as one `Begin .. End` frame. On open the
//! stream is replayed, and frames without an `End` marker are dropped. A store opened
//! without a path keeps everything in memory.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use tracing::{info, warn};

use crate::storage::{StorageResult, TracedStorageError};

const META_FILE: &str = "meta.json";
const META_FILE_TMP: &str = "meta.json.tmp";

/// Typed keys. The derived order groups keys by kind, then by tablet, so every
/// per-tablet family is a contiguous range.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetaKey {
    TabletMeta(u64),
    /// `(tablet, rowset id)`
    Rowset(u64, u32),
    /// `(tablet, log id)`
    Log(u64, u64),
    /// `(tablet, rowset-segment id, version)`
    DelVec(u64, u32, u64),
    /// `(tablet, version)`
    PendingRowset(u64, u64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum MetaOperation {
    Put(MetaKey, String),
    Delete(MetaKey),
    DeleteRange(MetaKey, MetaKey),
    // begin batch
    Begin,
    // end batch
    End,
}

/// A set of updates applied atomically by [`MetaStore::write_batch`].
#[derive(Default, Debug)]
pub struct WriteBatch {
    ops: Vec<MetaOperation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, key: MetaKey, value: &T) -> StorageResult<()> {
        self.ops
            .push(MetaOperation::Put(key, serde_json::to_string(value)?));
        Ok(())
    }

    pub fn delete(&mut self, key: MetaKey) {
        self.ops.push(MetaOperation::Delete(key));
    }

    /// Delete every key in `range`, both ends included.
    pub fn delete_range(&mut self, range: RangeInclusive<MetaKey>) {
        let (start, end) = range.into_inner();
        self.ops.push(MetaOperation::DeleteRange(start, end));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

struct Inner {
    map: BTreeMap<MetaKey, String>,
    file: Option<File>,
}

pub struct MetaStore {
    inner: Mutex<Inner>,
    dir: Option<PathBuf>,
    enable_fsync: bool,
    fail_writes: AtomicUsize,
}

impl MetaStore {
    /// Create a store that lives only in memory.
    pub fn new_mock() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                file: None,
            }),
            dir: None,
            enable_fsync: false,
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// Open (or create) the store under `dir` and replay its log.
    pub fn open(dir: impl AsRef<Path>, enable_fsync: bool) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(META_FILE))?;

        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let map = Self::replay(&data)?;
        info!(path = %dir.display(), keys = map.len(), "meta store opened");

        Ok(Self {
            inner: Mutex::new(Inner {
                map,
                file: Some(file),
            }),
            dir: Some(dir),
            enable_fsync,
            fail_writes: AtomicUsize::new(0),
        })
    }

    fn replay(data: &str) -> StorageResult<BTreeMap<MetaKey, String>> {
        let stream = Deserializer::from_str(data).into_iter::<MetaOperation>();

        let mut map = BTreeMap::new();
        let mut buffered_ops = vec![];
        let mut begin = false;

        for value in stream {
            let value = match value {
                Ok(value) => value,
                Err(e) if e.is_eof() => {
                    warn!("meta store: truncated entry at end of log");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            match value {
                MetaOperation::Begin => {
                    if !buffered_ops.is_empty() {
                        warn!("meta store: drop batch without end marker");
                        buffered_ops.clear();
                    }
                    begin = true;
                }
                MetaOperation::End => {
                    for op in buffered_ops.drain(..) {
                        Self::apply_op(&mut map, op);
                    }
                    begin = false;
                }
                op => {
                    if begin {
                        buffered_ops.push(op);
                    } else {
                        warn!("meta store: find entry without batch begin");
                    }
                }
            }
        }

        if !buffered_ops.is_empty() {
            warn!("meta store: find uncommitted entries");
        }
        Ok(map)
    }

    fn apply_op(map: &mut BTreeMap<MetaKey, String>, op: MetaOperation) {
        match op {
            MetaOperation::Put(key, value) => {
                map.insert(key, value);
            }
            MetaOperation::Delete(key) => {
                map.remove(&key);
            }
            MetaOperation::DeleteRange(start, end) => {
                let keys: Vec<_> = map.range(start..=end).map(|(k, _)| k.clone()).collect();
                for key in keys {
                    map.remove(&key);
                }
            }
            MetaOperation::Begin | MetaOperation::End => {}
        }
    }

    /// Make the next `n` calls of [`MetaStore::write_batch`] fail without side effects.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Apply all operations of `batch` atomically.
    pub fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TracedStorageError::from(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected meta store write failure",
            )));
        }

        let mut inner = self.inner.lock();
        if let Some(file) = &mut inner.file {
            let mut json = Vec::new();
            serde_json::to_writer(&mut json, &MetaOperation::Begin)?;
            for op in &batch.ops {
                serde_json::to_writer(&mut json, op)?;
            }
            serde_json::to_writer(&mut json, &MetaOperation::End)?;
            file.write_all(&json)?;
            if self.enable_fsync {
                file.sync_data()?;
            }
        }
        for op in batch.ops {
            Self::apply_op(&mut inner.map, op);
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &MetaKey) -> StorageResult<Option<T>> {
        let inner = self.inner.lock();
        match inner.map.get(key) {
            Some(value) => Ok(Some(serde_json::from_str(value)?)),
            None => Ok(None),
        }
    }

    /// All entries whose key lies in `range`, in key order.
    pub fn scan<T: DeserializeOwned>(
        &self,
        range: RangeInclusive<MetaKey>,
    ) -> StorageResult<Vec<(MetaKey, T)>> {
        let inner = self.inner.lock();
        inner
            .map
            .range(range)
            .map(|(k, v)| Ok((k.clone(), serde_json::from_str(v)?)))
            .collect()
    }

    /// Keys in `range`, without decoding their values.
    pub fn scan_keys(&self, range: RangeInclusive<MetaKey>) -> Vec<MetaKey> {
        self.inner
            .lock()
            .map
            .range(range)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log as a single frame holding the current content.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        let tmp_path = dir.join(META_FILE_TMP);
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut json = Vec::new();
            serde_json::to_writer(&mut json, &MetaOperation::Begin)?;
            for (key, value) in &inner.map {
                serde_json::to_writer(&mut json, &MetaOperation::Put(key.clone(), value.clone()))?;
            }
            serde_json::to_writer(&mut json, &MetaOperation::End)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, dir.join(META_FILE))?;
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(dir.join(META_FILE))?;
        inner.file = Some(file);
        info!(keys = inner.map.len(), "meta store checkpointed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(batch: &mut WriteBatch, key: MetaKey, v: u64) {
        batch.put(key, &v).unwrap();
    }

    #[test]
    fn test_batch_and_range() {
        let store = MetaStore::new_mock();
        let mut batch = WriteBatch::new();
        for log_id in 0..5 {
            put(&mut batch, MetaKey::Log(1, log_id), log_id * 10);
        }
        put(&mut batch, MetaKey::Log(2, 0), 99);
        store.write_batch(batch).unwrap();

        let logs: Vec<(MetaKey, u64)> = store
            .scan(MetaKey::Log(1, 0)..=MetaKey::Log(1, u64::MAX))
            .unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[4], (MetaKey::Log(1, 4), 40));

        let mut batch = WriteBatch::new();
        batch.delete_range(MetaKey::Log(1, 0)..=MetaKey::Log(1, 2));
        batch.delete(MetaKey::Log(2, 0));
        store.write_batch(batch).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get::<u64>(&MetaKey::Log(1, 3)).unwrap(), Some(30));
    }

    #[test]
    fn test_injected_failure() {
        let store = MetaStore::new_mock();
        store.fail_next_writes(1);
        let mut batch = WriteBatch::new();
        put(&mut batch, MetaKey::TabletMeta(1), 1);
        assert!(store.write_batch(batch).is_err());
        assert!(store.is_empty());

        let mut batch = WriteBatch::new();
        put(&mut batch, MetaKey::TabletMeta(1), 1);
        store.write_batch(batch).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MetaStore::open(dir.path(), false).unwrap();
            let mut batch = WriteBatch::new();
            put(&mut batch, MetaKey::DelVec(1, 3, 2), 7);
            put(&mut batch, MetaKey::PendingRowset(1, 9), 8);
            store.write_batch(batch).unwrap();
            let mut batch = WriteBatch::new();
            batch.delete(MetaKey::PendingRowset(1, 9));
            store.write_batch(batch).unwrap();
        }
        // a torn batch at the tail is ignored
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(META_FILE))
            .unwrap();
        file.write_all(br#""Begin"{"Delete":{"DelVec":[1,3,2]}}"#)
            .unwrap();
        drop(file);

        let store = MetaStore::open(dir.path(), false).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get::<u64>(&MetaKey::DelVec(1, 3, 2)).unwrap(), Some(7));

        store.checkpoint().unwrap();
        let store = MetaStore::open(dir.path(), false).unwrap();
        assert_eq!(store.len(), 1);
    }
}
