// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Typed access to the metadata of one tablet.
//!
//! Layout in the [`MetaStore`]:
//!
//! * `TabletMeta(tablet)`: schema and the compacted version list.
//! * `Log(tablet, log_id)`: commits and applies since the last compaction of the list.
//! * `Rowset(tablet, rowset_id)`: committed rowsets.
//! * `PendingRowset(tablet, version)`: rowsets that arrived before their predecessor.
//! * `DelVec(tablet, rssid, version)`: delete vectors.

use serde::{Deserialize, Serialize};

use super::edit_version::{EditVersion, EditVersionMeta, RowsetId};
use super::meta_store::{MetaKey, MetaStore, WriteBatch};
use super::rowset::RowsetMeta;
use super::schema::TabletSchema;
use super::DelVector;
use crate::storage::{StorageResult, TracedStorageError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: u64,
    pub schema: TabletSchema,
    pub updates: TabletUpdatesMeta,
}

/// Snapshot of the version state of a tablet. Log entries with an id at or above
/// `next_log_id` are replayed on top of it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletUpdatesMeta {
    pub versions: Vec<EditVersionMeta>,
    pub apply_version: EditVersion,
    pub next_rowset_id: RowsetId,
    pub next_log_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletMetaLogOp {
    RowsetCommit(EditVersionMeta),
    CompactionCommit(EditVersionMeta),
    Apply(EditVersion),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMetaLog {
    pub ops: Vec<TabletMetaLogOp>,
}

fn log_range(tablet: u64) -> std::ops::RangeInclusive<MetaKey> {
    MetaKey::Log(tablet, 0)..=MetaKey::Log(tablet, u64::MAX)
}

fn rowset_range(tablet: u64) -> std::ops::RangeInclusive<MetaKey> {
    MetaKey::Rowset(tablet, 0)..=MetaKey::Rowset(tablet, u32::MAX)
}

fn pending_range(tablet: u64) -> std::ops::RangeInclusive<MetaKey> {
    MetaKey::PendingRowset(tablet, 0)..=MetaKey::PendingRowset(tablet, u64::MAX)
}

fn delvec_range(tablet: u64) -> std::ops::RangeInclusive<MetaKey> {
    MetaKey::DelVec(tablet, 0, 0)..=MetaKey::DelVec(tablet, u32::MAX, u64::MAX)
}

/// Serialize delete vectors into a batch to be completed by
/// [`MetaStore::apply_rowset_commit`].
pub fn del_vector_batch(tablet: u64, delvecs: &[(u32, DelVector)]) -> StorageResult<WriteBatch> {
    let mut batch = WriteBatch::new();
    for (rssid, delvec) in delvecs {
        batch.put(MetaKey::DelVec(tablet, *rssid, delvec.version()), delvec)?;
    }
    Ok(batch)
}

impl MetaStore {
    pub fn get_tablet_meta(&self, tablet: u64) -> StorageResult<Option<TabletMeta>> {
        self.get(&MetaKey::TabletMeta(tablet))
    }

    /// Ids of all tablets in the store.
    pub fn tablet_ids(&self) -> Vec<u64> {
        self.scan_keys(MetaKey::TabletMeta(0)..=MetaKey::TabletMeta(u64::MAX))
            .into_iter()
            .filter_map(|k| match k {
                MetaKey::TabletMeta(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn save_tablet_meta(&self, meta: &TabletMeta) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(MetaKey::TabletMeta(meta.tablet_id), meta)?;
        self.write_batch(batch)
    }

    /// Replace the version snapshot and drop the log entries it covers.
    pub fn save_updates_meta(&self, tablet: u64, updates: TabletUpdatesMeta) -> StorageResult<()> {
        let Some(mut meta) = self.get_tablet_meta(tablet)? else {
            return Err(TracedStorageError::not_found("tablet", tablet));
        };
        let mut batch = WriteBatch::new();
        if updates.next_log_id > 0 {
            batch.delete_range(MetaKey::Log(tablet, 0)..=MetaKey::Log(tablet, updates.next_log_id - 1));
        }
        meta.updates = updates;
        batch.put(MetaKey::TabletMeta(tablet), &meta)?;
        self.write_batch(batch)
    }

    /// Log a commit and persist its rowset in one batch. A pending entry for the same
    /// version is removed.
    pub fn rowset_commit(
        &self,
        tablet: u64,
        log_id: u64,
        edit: &EditVersionMeta,
        rowset_meta: &RowsetMeta,
    ) -> StorageResult<()> {
        let op = if edit.compaction.is_some() {
            TabletMetaLogOp::CompactionCommit(edit.clone())
        } else {
            TabletMetaLogOp::RowsetCommit(edit.clone())
        };
        let mut batch = WriteBatch::new();
        batch.put(MetaKey::Log(tablet, log_id), &TabletMetaLog { ops: vec![op] })?;
        batch.put(MetaKey::Rowset(tablet, rowset_meta.rowset_id), rowset_meta)?;
        if edit.compaction.is_none() {
            batch.delete(MetaKey::PendingRowset(tablet, edit.version.major));
        }
        self.write_batch(batch)
    }

    pub fn pending_rowset_commit(
        &self,
        tablet: u64,
        version: u64,
        rowset_meta: &RowsetMeta,
    ) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(MetaKey::PendingRowset(tablet, version), rowset_meta)?;
        self.write_batch(batch)
    }

    pub fn remove_pending_rowset(&self, tablet: u64, version: u64) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(MetaKey::PendingRowset(tablet, version));
        self.write_batch(batch)
    }

    /// Log an apply on top of `delvecs`, the batch of delete vectors it produced
    /// (see [`del_vector_batch`]), and write both atomically.
    pub fn apply_rowset_commit(
        &self,
        tablet: u64,
        log_id: u64,
        version: EditVersion,
        mut delvecs: WriteBatch,
    ) -> StorageResult<()> {
        delvecs.put(
            MetaKey::Log(tablet, log_id),
            &TabletMetaLog {
                ops: vec![TabletMetaLogOp::Apply(version)],
            },
        )?;
        self.write_batch(delvecs)
    }

    /// The newest delete vector of `rssid` with a version no greater than `max_version`.
    pub fn get_del_vector(
        &self,
        tablet: u64,
        rssid: u32,
        max_version: u64,
    ) -> StorageResult<Option<DelVector>> {
        let mut found = self.scan::<DelVector>(
            MetaKey::DelVec(tablet, rssid, 0)..=MetaKey::DelVec(tablet, rssid, max_version),
        )?;
        Ok(found.pop().map(|(_, dv)| dv))
    }

    /// For every segment with a delete vector older than `max_version`, the newest
    /// such version.
    pub fn list_del_vector(&self, tablet: u64, max_version: u64) -> Vec<(u32, u64)> {
        let mut ret: Vec<(u32, u64)> = vec![];
        for key in self.scan_keys(delvec_range(tablet)) {
            let MetaKey::DelVec(_, rssid, version) = key else {
                continue;
            };
            if version >= max_version {
                continue;
            }
            match ret.last_mut() {
                Some((last, v)) if *last == rssid => *v = version,
                _ => ret.push((rssid, version)),
            }
        }
        ret
    }

    /// Delete the delete vectors of `rssid` with versions in `[start, end)`.
    pub fn delete_del_vector_range(
        &self,
        tablet: u64,
        rssid: u32,
        start: u64,
        end: u64,
    ) -> StorageResult<()> {
        if start >= end {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.delete_range(MetaKey::DelVec(tablet, rssid, start)..=MetaKey::DelVec(tablet, rssid, end - 1));
        self.write_batch(batch)
    }

    /// Log entries in id order.
    pub fn traverse_meta_logs(&self, tablet: u64) -> StorageResult<Vec<(u64, TabletMetaLog)>> {
        Ok(self
            .scan::<TabletMetaLog>(log_range(tablet))?
            .into_iter()
            .filter_map(|(k, log)| match k {
                MetaKey::Log(_, id) => Some((id, log)),
                _ => None,
            })
            .collect())
    }

    pub fn pending_rowset_iterate(&self, tablet: u64) -> StorageResult<Vec<(u64, RowsetMeta)>> {
        Ok(self
            .scan::<RowsetMeta>(pending_range(tablet))?
            .into_iter()
            .filter_map(|(k, meta)| match k {
                MetaKey::PendingRowset(_, version) => Some((version, meta)),
                _ => None,
            })
            .collect())
    }

    pub fn rowset_iterate(&self, tablet: u64) -> StorageResult<Vec<RowsetMeta>> {
        Ok(self
            .scan::<RowsetMeta>(rowset_range(tablet))?
            .into_iter()
            .map(|(_, meta)| meta)
            .collect())
    }

    /// Remove a rowset and the delete vectors of all its segments.
    pub fn rowset_delete(&self, tablet: u64, rowset_id: RowsetId, num_segments: usize) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(MetaKey::Rowset(tablet, rowset_id));
        for i in 0..num_segments as u32 {
            let rssid = rowset_id + i;
            batch.delete_range(MetaKey::DelVec(tablet, rssid, 0)..=MetaKey::DelVec(tablet, rssid, u64::MAX));
        }
        self.write_batch(batch)
    }

    /// Replace everything stored for `meta.tablet_id` by `meta`, `rowsets` and the
    /// delete vectors of their segments, in one batch.
    pub fn reset_tablet(
        &self,
        meta: &TabletMeta,
        rowsets: &[RowsetMeta],
        delvecs: &[(u32, DelVector)],
    ) -> StorageResult<()> {
        let tablet = meta.tablet_id;
        let mut batch = WriteBatch::new();
        batch.delete_range(pending_range(tablet));
        batch.delete_range(rowset_range(tablet));
        batch.delete_range(delvec_range(tablet));
        batch.delete_range(log_range(tablet));
        batch.put(MetaKey::TabletMeta(tablet), meta)?;
        for rowset in rowsets {
            batch.put(MetaKey::Rowset(tablet, rowset.rowset_id), rowset)?;
        }
        for (rssid, delvec) in delvecs {
            batch.put(MetaKey::DelVec(tablet, *rssid, delvec.version()), delvec)?;
        }
        self.write_batch(batch)
    }

    /// Remove everything stored for `tablet`.
    pub fn clear_tablet(&self, tablet: u64) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(pending_range(tablet));
        batch.delete_range(rowset_range(tablet));
        batch.delete_range(delvec_range(tablet));
        batch.delete_range(log_range(tablet));
        batch.delete(MetaKey::TabletMeta(tablet));
        self.write_batch(batch)
    }
}
