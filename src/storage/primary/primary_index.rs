// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use super::primary_key_encoder::{EncodedKey, PrimaryKeyEncoder};
use super::rowset::Segment;
use super::DelVector;
use crate::storage::StorageResult;

/// Rowset-segment id to the row ordinals deleted in it.
pub type DeletesMap = BTreeMap<u32, Vec<u32>>;

/// One segment visible at the applied version of a tablet.
pub struct IndexSegment {
    pub rssid: u32,
    pub segment: Arc<Segment>,
    pub delvec: Option<DelVector>,
}

/// What a primary index is built from.
pub trait IndexSource {
    fn tablet_id(&self) -> u64;

    fn num_key_columns(&self) -> usize;

    /// Segments of the applied version, with their latest delete vectors.
    fn applied_segments(&self) -> StorageResult<Vec<IndexSegment>>;
}

/// Maps every live primary key of a tablet to its location.
pub trait PrimaryIndex: Send + Sync {
    /// Build the index if it is not loaded yet.
    fn load(&mut self, source: &dyn IndexSource) -> StorageResult<()>;

    /// Point `keys` at `(rssid, start_ordinal + i)`. Locations that are replaced are
    /// reported in `deletes`.
    fn upsert(&mut self, rssid: u32, start_ordinal: u32, keys: &[EncodedKey], deletes: &mut DeletesMap);

    /// Remove `keys`, reporting their locations in `deletes`.
    fn erase(&mut self, keys: &[EncodedKey], deletes: &mut DeletesMap);

    /// Move `keys` to `(rssid, start_ordinal + i)`, but only where the key still lives
    /// in `src_rssids[i]`. Ordinals that could not be moved are pushed to `failed`.
    /// Never grows the index.
    fn try_replace(
        &mut self,
        rssid: u32,
        start_ordinal: u32,
        keys: &[EncodedKey],
        src_rssids: &[u32],
        failed: &mut Vec<u32>,
    );

    fn memory_usage(&self) -> usize;

    /// Number of keys.
    fn size(&self) -> usize;

    fn unload(&mut self);
}

fn pack(rssid: u32, ordinal: u32) -> u64 {
    ((rssid as u64) << 32) | ordinal as u64
}

fn unpack(location: u64) -> (u32, u32) {
    ((location >> 32) as u32, location as u32)
}

/// A [`PrimaryIndex`] backed by a hash map.
#[derive(Default)]
pub struct HashPrimaryIndex {
    tablet_id: u64,
    loaded: bool,
    map: HashMap<EncodedKey, u64>,
    key_bytes: usize,
}

impl HashPrimaryIndex {
    pub fn new(tablet_id: u64) -> Self {
        Self {
            tablet_id,
            ..Default::default()
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Location of `key` as `(rssid, ordinal)`.
    pub fn get(&self, key: &[u8]) -> Option<(u32, u32)> {
        self.map.get(key).map(|loc| unpack(*loc))
    }
}

impl PrimaryIndex for HashPrimaryIndex {
    fn load(&mut self, source: &dyn IndexSource) -> StorageResult<()> {
        if self.loaded {
            return Ok(());
        }
        self.tablet_id = source.tablet_id();
        let segments = source.applied_segments()?;
        let mut deletes = DeletesMap::new();
        for IndexSegment {
            rssid,
            segment,
            delvec,
        } in &segments
        {
            let keys = PrimaryKeyEncoder::encode_chunk(segment.chunk(), source.num_key_columns())?;
            for (ordinal, key) in keys.into_iter().enumerate() {
                if delvec.as_ref().is_some_and(|dv| dv.contains(ordinal as u32)) {
                    continue;
                }
                self.upsert(*rssid, ordinal as u32, std::slice::from_ref(&key), &mut deletes);
            }
        }
        // live rows never share a key, anything displaced here means broken delete vectors
        if !deletes.is_empty() {
            self.unload();
            return Err(crate::storage::TracedStorageError::corruption(format!(
                "tablet {} has duplicated live keys in {} segments",
                source.tablet_id(),
                deletes.len()
            )));
        }
        self.loaded = true;
        info!(
            tablet = self.tablet_id,
            segments = segments.len(),
            keys = self.map.len(),
            "primary index loaded"
        );
        Ok(())
    }

    fn upsert(&mut self, rssid: u32, start_ordinal: u32, keys: &[EncodedKey], deletes: &mut DeletesMap) {
        for (i, key) in keys.iter().enumerate() {
            let location = pack(rssid, start_ordinal + i as u32);
            if let Some(old) = self.map.get_mut(key) {
                let (old_rssid, old_ordinal) = unpack(*old);
                deletes.entry(old_rssid).or_default().push(old_ordinal);
                *old = location;
            } else {
                self.key_bytes += key.len();
                self.map.insert(key.clone(), location);
            }
        }
    }

    fn erase(&mut self, keys: &[EncodedKey], deletes: &mut DeletesMap) {
        for key in keys {
            if let Some(old) = self.map.remove(key) {
                self.key_bytes -= key.len();
                let (old_rssid, old_ordinal) = unpack(old);
                deletes.entry(old_rssid).or_default().push(old_ordinal);
            }
        }
    }

    fn try_replace(
        &mut self,
        rssid: u32,
        start_ordinal: u32,
        keys: &[EncodedKey],
        src_rssids: &[u32],
        failed: &mut Vec<u32>,
    ) {
        for (i, (key, src)) in keys.iter().zip(src_rssids).enumerate() {
            let ordinal = start_ordinal + i as u32;
            match self.map.get_mut(key) {
                Some(location) if unpack(*location).0 == *src => *location = pack(rssid, ordinal),
                _ => failed.push(ordinal),
            }
        }
    }

    fn memory_usage(&self) -> usize {
        self.key_bytes + self.map.capacity() * (std::mem::size_of::<EncodedKey>() + 8)
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn unload(&mut self) {
        self.map = HashMap::new();
        self.key_bytes = 0;
        self.loaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ids: &[u8]) -> Vec<EncodedKey> {
        ids.iter().map(|i| vec![*i]).collect()
    }

    #[test]
    fn test_upsert_and_erase() {
        let mut index = HashPrimaryIndex::new(1);
        let mut deletes = DeletesMap::new();
        index.upsert(0, 0, &keys(&[1, 2, 3]), &mut deletes);
        assert!(deletes.is_empty());

        index.upsert(1, 0, &keys(&[3, 4]), &mut deletes);
        assert_eq!(deletes, DeletesMap::from([(0, vec![2])]));
        assert_eq!(index.get(&[3]), Some((1, 0)));

        deletes.clear();
        index.erase(&keys(&[1, 9]), &mut deletes);
        assert_eq!(deletes, DeletesMap::from([(0, vec![0])]));
        assert_eq!(index.size(), 3);
    }

    #[test]
    fn test_try_replace() {
        let mut index = HashPrimaryIndex::new(1);
        let mut deletes = DeletesMap::new();
        index.upsert(0, 0, &keys(&[1, 2]), &mut deletes);
        index.upsert(1, 0, &keys(&[3]), &mut deletes);
        // key 2 was overwritten by rssid 5 after the compaction started
        index.upsert(5, 0, &keys(&[2]), &mut deletes);
        // key 1 was deleted
        index.erase(&keys(&[1]), &mut deletes);

        let mut failed = vec![];
        index.try_replace(10, 0, &keys(&[1, 2, 3]), &[0, 0, 1], &mut failed);
        assert_eq!(failed, vec![0, 1]);
        assert_eq!(index.get(&[3]), Some((10, 2)));
        assert_eq!(index.get(&[2]), Some((5, 0)));
        assert_eq!(index.size(), 2);
    }
}
