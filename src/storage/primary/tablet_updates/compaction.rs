// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use itertools::Itertools;
use rand::Rng;
use tracing::{error, info, warn};

use super::{RowsetStats, TabletUpdates};
use crate::storage::primary::edit_version::{
    modify, unix_millis, unix_seconds, CompactionInfo, EditVersion, EditVersionInfo, EditVersionMeta,
    RowsetId,
};
use crate::storage::primary::merge_iterator::{HeapMergeIterator, MaskMergeIterator, RowSourceMask};
use crate::storage::primary::rowset::Rowset;
use crate::storage::{ChunkIterator, StorageResult, TracedStorageError};

/// A rowset that may join a compaction.
#[derive(Debug)]
struct CompactionCandidate {
    rowset_id: RowsetId,
    score_per_row: f64,
    num_rows: usize,
    num_dels: usize,
    bytes: usize,
}

/// The rowsets picked for one compaction, with estimates for logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct CompactionPick {
    pub inputs: Vec<RowsetId>,
    /// Rowsets with a positive score.
    pub total_valid: usize,
    pub total_rows: usize,
    pub rows_after: usize,
    pub bytes_after: usize,
}

/// Pick compaction inputs among `rowsets`.
///
/// Fully deleted rowsets are always picked. The rest are taken in descending score per
/// live row until the estimated output passes a threshold; the last pick may overshoot
/// by half a threshold.
pub(super) fn pick_compaction_inputs(
    rowsets: &[(RowsetId, RowsetStats)],
    rows_threshold: i64,
    bytes_threshold: i64,
) -> CompactionPick {
    let mut pick = CompactionPick::default();
    let mut candidates = vec![];
    for (id, stat) in rowsets {
        if stat.compaction_score <= 0 {
            continue;
        }
        pick.total_valid += 1;
        if stat.num_rows == stat.num_dels {
            pick.inputs.push(*id);
            pick.total_rows += stat.num_rows;
            continue;
        }
        candidates.push(CompactionCandidate {
            rowset_id: *id,
            score_per_row: stat.compaction_score as f64 / (stat.num_rows - stat.num_dels) as f64,
            num_rows: stat.num_rows,
            num_dels: stat.num_dels,
            bytes: stat.byte_size,
        });
    }
    candidates.sort_by(|a, b| b.score_per_row.total_cmp(&a.score_per_row));

    let rows_threshold = rows_threshold.max(0) as usize;
    let bytes_threshold = bytes_threshold.max(0) as usize;
    for c in candidates {
        let live = c.num_rows - c.num_dels;
        let new_rows = pick.rows_after + live;
        let new_bytes = pick.bytes_after + c.bytes * live / c.num_rows;
        if !pick.inputs.is_empty()
            && (new_rows > rows_threshold * 3 / 2 || new_bytes > bytes_threshold * 3 / 2)
        {
            break;
        }
        pick.inputs.push(c.rowset_id);
        pick.total_rows += c.num_rows;
        pick.rows_after = new_rows;
        pick.bytes_after = new_bytes;
        if new_bytes > bytes_threshold || new_rows > rows_threshold {
            break;
        }
    }
    pick.inputs.sort_unstable();
    pick
}

impl TabletUpdates {
    /// Score of compacting this tablet now, or `-1` when it should not be compacted.
    pub fn get_compaction_score(&self) -> i64 {
        if self.compaction_running.load(Ordering::Acquire) || self.is_error() {
            return -1;
        }
        let min_interval = self.ctx.options().compaction_min_interval.as_millis() as i64;
        if self.last_compaction_time_ms.load(Ordering::Relaxed) + min_interval > unix_millis() {
            return -1;
        }
        let rowsets = {
            let state = self.state.lock();
            if state.apply_version_idx + 2 < state.versions.len() || state.pending_commits.len() >= 2 {
                return -1;
            }
            if state.versions[state.apply_version_idx + 1..]
                .iter()
                .any(|v| v.compaction.is_some())
            {
                return -1;
            }
            match state.applied() {
                Ok(v) => v.rowsets.clone(),
                Err(_) => return -1,
            }
        };
        let cost_seek = self.ctx.options().compaction_cost_seek;
        let stats = self.rowset_stats.lock();
        let mut total = -cost_seek;
        for id in rowsets {
            let Some(st) = stats.get(&id) else {
                warn!(tablet = self.tablet_id, rowset = id, "rowset stats not found");
                return -1;
            };
            if st.compaction_score > 0 {
                total += st.compaction_score;
            }
        }
        total
    }

    /// Compact rowsets of the applied version into one, then wait for the result to be
    /// applied. Only one compaction runs at a time.
    pub fn compaction(&self) -> StorageResult<()> {
        self.check_error()?;
        if self
            .compaction_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TracedStorageError::internal(
                "another compaction is running",
            ));
        }
        let result = self.compaction_inner();
        if !matches!(result, Ok(true)) {
            self.compaction_running.store(false, Ordering::Release);
        }
        result.map(|_| ())
    }

    /// Returns whether a compaction was committed.
    fn compaction_inner(&self) -> StorageResult<bool> {
        let (start_version, rowsets) = {
            let state = self.state.lock();
            let applied = state.applied()?;
            (applied.version, applied.rowsets.clone())
        };
        let with_stats = {
            let stats = self.rowset_stats.lock();
            rowsets
                .iter()
                .filter_map(|id| match stats.get(id) {
                    Some(st) => Some((*id, st.clone())),
                    None => {
                        warn!(tablet = self.tablet_id, rowset = id, "rowset stats not found");
                        None
                    }
                })
                .collect_vec()
        };
        let options = self.ctx.options();
        let pick = pick_compaction_inputs(
            &with_stats,
            options.compaction_result_rows_threshold,
            options.compaction_result_bytes_threshold,
        );
        if pick.total_valid.saturating_sub(pick.inputs.len()) <= 3 {
            // jitter so tablets of one table do not compact in lockstep
            let max_jitter = (options.compaction_min_interval.as_millis() as i64).min(10_000);
            let jitter = if max_jitter > 0 {
                rand::thread_rng().gen_range(0..max_jitter)
            } else {
                0
            };
            self.last_compaction_time_ms
                .store(unix_millis() + jitter, Ordering::Relaxed);
        }
        info!(
            tablet = self.tablet_id,
            version = %start_version,
            pick = pick.inputs.len(),
            valid = pick.total_valid,
            all = rowsets.len(),
            inputs = %pick.inputs.iter().join(","),
            rows = pick.total_rows,
            rows_after = pick.rows_after,
            bytes_after = pick.bytes_after,
            "compaction start"
        );
        if pick.inputs.is_empty() {
            return Ok(false);
        }

        let output = self.do_compaction(start_version, &pick.inputs)?;
        let version = self.commit_compaction(
            CompactionInfo {
                start_version,
                inputs: pick.inputs,
                output: 0,
            },
            output,
        )?;
        // committed, so a slow apply is not a failure of this compaction
        if let Err(e) = self.wait_for_version(version, options.compaction_wait_timeout) {
            warn!(tablet = self.tablet_id, version = %version, error = %e, "compaction apply not finished");
        }
        Ok(true)
    }

    /// Merge the inputs as of `start_version` into a new rowset.
    pub(super) fn do_compaction(&self, start_version: EditVersion, inputs: &[RowsetId]) -> StorageResult<Rowset> {
        let mut input_rowsets = Vec::with_capacity(inputs.len());
        for id in inputs {
            let Some(rowset) = self.get_rowset(*id) else {
                let msg = format!("compaction input rowset {id} should exist");
                error!(state = %self.debug_string(), "{msg}");
                self.set_error(&msg);
                return Err(TracedStorageError::internal(msg));
            };
            input_rowsets.push(rowset);
        }

        // every child is one input segment; `sources[i]` is its rssid
        let mut sources = vec![];
        for rowset in &input_rowsets {
            sources.extend((0..rowset.num_segments() as u32).map(|i| rowset.rowset_id() + i));
        }
        let num_keys = self.schema.num_key_columns();
        let chunk_size = self.ctx.options().chunk_size;

        // merge the key columns first to fix the row order
        let mut masks: Vec<RowSourceMask> = vec![];
        let mut merge = HeapMergeIterator::new(
            self.segment_iterators(&input_rowsets, start_version.major, Some(num_keys))?,
            num_keys,
        )?;
        while merge.next_batch(Some(chunk_size), Some(&mut masks))?.is_some() {}

        // then read full rows in that order
        let mut writer = self.new_writer();
        let mut replay = MaskMergeIterator::new(
            self.segment_iterators(&input_rowsets, start_version.major, None)?,
            masks.clone(),
        )?;
        let mut pos = 0;
        while let Some(chunk) = replay.next_batch(Some(chunk_size))? {
            let src_rssids = masks[pos..pos + chunk.cardinality()]
                .iter()
                .map(|m| sources[m.source as usize])
                .collect_vec();
            pos += chunk.cardinality();
            writer.append_sorted(chunk, &src_rssids)?;
        }
        writer.build()
    }

    fn segment_iterators(
        &self,
        rowsets: &[Arc<Rowset>],
        version: u64,
        key_only: Option<usize>,
    ) -> StorageResult<Vec<Box<dyn ChunkIterator>>> {
        let mut iters: Vec<Box<dyn ChunkIterator>> = vec![];
        for rowset in rowsets {
            let delvecs = (0..rowset.num_segments() as u32)
                .map(|i| {
                    self.ctx
                        .get_del_vec(self.tablet_id, rowset.rowset_id() + i, version)
                })
                .collect::<StorageResult<Vec<_>>>()?;
            for iter in rowset.get_segment_iterators(delvecs, self.ctx.options().chunk_size)? {
                iters.push(match key_only {
                    Some(n) => Box::new(iter.project_prefix(n)),
                    None => Box::new(iter),
                });
            }
        }
        Ok(iters)
    }

    /// Log the compaction output as a new minor version of the latest version.
    pub(super) fn commit_compaction(&self, mut info: CompactionInfo, rowset: Rowset) -> StorageResult<EditVersion> {
        let version = {
            let mut state = self.state.lock();
            let last = state.last()?.clone();
            let version = EditVersion::new(last.version.major, last.version.minor + 1);
            for id in &info.inputs {
                if !last.rowsets.contains(id) {
                    let msg = format!("compaction input rowset {id} not found in version {}", last.version);
                    warn!(tablet = self.tablet_id, "{msg}");
                    return Err(TracedStorageError::cancelled(msg));
                }
            }
            let rowset_id = state.next_rowset_id;
            let rowsets = modify(&last.rowsets, &[rowset_id], &info.inputs);
            info.output = rowset_id;

            let creation_time = unix_seconds();
            let mut edit = EditVersionMeta {
                version,
                creation_time,
                compaction: Some(info.clone()),
                rowsetid_add: (rowset.num_segments() as u32).max(1),
                ..Default::default()
            };
            if rowsets.len() <= self.ctx.options().full_rowset_list_threshold {
                edit.rowsets = rowsets.clone();
            } else {
                edit.rowsets_del = info.inputs.clone();
                edit.rowsets_add = vec![rowset_id];
            }

            let committed = Arc::new(rowset.make_commit(version.major, rowset_id));
            if let Err(e) = self.ctx.meta().rowset_commit(
                self.tablet_id,
                state.next_log_id,
                &edit,
                committed.meta(),
            ) {
                warn!(tablet = self.tablet_id, error = %e, "compaction commit failed");
                return Err(e);
            }
            state.next_log_id += 1;
            state.next_rowset_id += edit.rowsetid_add;
            state.versions.push(Arc::new(EditVersionInfo {
                version,
                creation_time,
                rowsets,
                deltas: vec![],
                compaction: Some(info.clone()),
            }));
            self.rowsets.write().insert(rowset_id, committed.clone());
            self.rowset_stats.lock().insert(
                rowset_id,
                RowsetStats::new(&committed, self.ctx.options().compaction_cost_seek),
            );
            info!(
                tablet = self.tablet_id,
                version = %version,
                rowset = rowset_id,
                segments = committed.num_segments(),
                rows = committed.num_rows(),
                bytes = committed.data_disk_size(),
                "commit compaction"
            );
            version
        };
        self.check_for_apply();
        Ok(version)
    }
}
