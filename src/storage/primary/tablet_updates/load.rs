// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use super::{calc_compaction_score, RowsetStats, TabletUpdates};
use crate::storage::primary::edit_version::{unix_millis, unix_seconds, EditVersionMeta, RowsetId};
use crate::storage::primary::rowset::Rowset;
use crate::storage::primary::tablet_meta_manager::{TabletMeta, TabletMetaLogOp, TabletUpdatesMeta};
use crate::storage::primary::DelVector;
use crate::storage::{StorageResult, TracedStorageError};

impl TabletUpdates {
    /// Rebuild the in-memory state from the persisted snapshot, log, and rowsets.
    ///
    /// Inconsistent metadata puts the tablet into the error state instead of failing, so
    /// the tablet can still be inspected and dropped.
    pub(super) fn load(&self, updates: TabletUpdatesMeta) -> StorageResult<()> {
        if updates.versions.is_empty() {
            return Err(TracedStorageError::corruption(format!(
                "tablet {} has no version",
                self.tablet_id
            )));
        }
        let meta = self.ctx.meta();
        let unapplied = {
            let mut state = self.state.lock();
            state.versions.clear();
            state.pending_commits.clear();
            let mut last: Option<Vec<RowsetId>> = None;
            for v in &updates.versions {
                let info = v.redo(last.as_deref());
                last = Some(info.rowsets.clone());
                state.versions.push(Arc::new(info));
            }
            match state
                .versions
                .iter()
                .position(|v| v.version == updates.apply_version)
            {
                Some(idx) => state.apply_version_idx = idx,
                None => {
                    self.mark_error_on_load(format!(
                        "apply version {} not found",
                        updates.apply_version
                    ));
                    return Ok(());
                }
            }
            state.next_rowset_id = updates.next_rowset_id;
            state.next_log_id = updates.next_log_id;

            for (log_id, log) in meta.traverse_meta_logs(self.tablet_id)? {
                if log_id < updates.next_log_id {
                    continue;
                }
                for op in log.ops {
                    match op {
                        TabletMetaLogOp::RowsetCommit(edit) | TabletMetaLogOp::CompactionCommit(edit) => {
                            let last = state.last()?.rowsets.clone();
                            let info = edit.redo(Some(last.as_slice()));
                            state.next_rowset_id += edit.rowsetid_add;
                            state.versions.push(Arc::new(info));
                        }
                        TabletMetaLogOp::Apply(version) => {
                            let found = state.versions[state.apply_version_idx..]
                                .iter()
                                .position(|v| v.version == version);
                            match found {
                                Some(offset) => state.apply_version_idx += offset,
                                None => {
                                    self.mark_error_on_load(format!(
                                        "applied version {version} in log {log_id} not found"
                                    ));
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                state.next_log_id = log_id + 1;
            }

            for (version, rowset_meta) in meta.pending_rowset_iterate(self.tablet_id)? {
                state
                    .pending_commits
                    .insert(version, Arc::new(Rowset::new(rowset_meta)));
            }

            let all: HashMap<RowsetId, Arc<Rowset>> = meta
                .rowset_iterate(self.tablet_id)?
                .into_iter()
                .map(|m| (m.rowset_id, Arc::new(Rowset::new(m))))
                .collect();
            let active: BTreeSet<RowsetId> = state
                .versions
                .iter()
                .flat_map(|v| v.rowsets.iter().copied())
                .collect();
            let applied: BTreeSet<RowsetId> = state.versions[..=state.apply_version_idx]
                .iter()
                .flat_map(|v| v.rowsets.iter().copied())
                .collect();

            let missing = active.iter().filter(|id| !all.contains_key(id)).collect_vec();
            if !missing.is_empty() {
                self.mark_error_on_load(format!("active rowsets {missing:?} not found"));
                return Ok(());
            }

            let mut rowsets = self.rowsets.write();
            let mut unused = self.unused_rowsets.lock();
            rowsets.clear();
            for (id, rowset) in all {
                if active.contains(&id) {
                    rowsets.insert(id, rowset);
                } else {
                    unused.push_back(rowset);
                }
            }

            let cost_seek = self.ctx.options().compaction_cost_seek;
            let mut stats = self.rowset_stats.lock();
            stats.clear();
            for id in &active {
                let Some(rowset) = rowsets.get(id) else {
                    continue;
                };
                let mut st = RowsetStats::new(rowset, cost_seek);
                if applied.contains(id) {
                    for i in 0..rowset.num_segments() as u32 {
                        match meta.get_del_vector(self.tablet_id, id + i, u64::MAX)? {
                            Some(dv) => st.num_dels += dv.cardinality(),
                            None => {
                                drop((stats, unused, rowsets));
                                self.mark_error_on_load(format!(
                                    "delete vector of segment {} not found",
                                    id + i
                                ));
                                return Ok(());
                            }
                        }
                    }
                    st.compaction_score = calc_compaction_score(&st, cost_seek);
                }
                stats.insert(*id, st);
            }
            active.len() - applied.len().min(active.len())
        };

        let applied_rowsets = self.state.lock().applied()?.rowsets.clone();
        self.update_total_stats(&applied_rowsets);
        {
            let mut state = self.state.lock();
            self.try_commit_pendings(&mut state);
        }
        info!(
            tablet = self.tablet_id,
            versions = self.versions().len(),
            applied = %self.applied_version(),
            latest = %self.max_version(),
            pending = self.num_pending(),
            unapplied_rowsets = unapplied,
            unused_rowsets = self.unused_rowsets.lock().len(),
            "tablet loaded"
        );
        self.check_for_apply();
        Ok(())
    }

    fn mark_error_on_load(&self, reason: String) {
        error!(tablet = self.tablet_id, %reason, "failed to load tablet updates");
        self.error.store(true, Ordering::Release);
    }

    /// Drop versions created at or before `expire_time` (unix seconds) that are older
    /// than the applied one, then delete rowsets and delete vectors nothing refers to.
    pub fn remove_expired_versions(&self, expire_time: i64) {
        if self.is_error() {
            warn!(tablet = self.tablet_id, "tablet in error state, cannot remove expired versions");
            return;
        }
        let expired = {
            let mut state = self.state.lock();
            let mut n = 0;
            while n < state.apply_version_idx && state.versions[n].creation_time <= expire_time {
                n += 1;
            }
            if n == 0 {
                vec![]
            } else {
                let expired = state.versions.drain(..n).collect_vec();
                state.apply_version_idx -= n;
                // snapshot under the lock, so no log entry can slip between
                let saved = state
                    .to_updates_meta()
                    .and_then(|m| self.ctx.meta().save_updates_meta(self.tablet_id, m));
                if let Err(e) = saved {
                    warn!(tablet = self.tablet_id, error = %e, "failed to save updates meta");
                }
                expired
            }
        };

        if let Some(max_expired) = expired.last().map(|v| v.version.major) {
            let active: BTreeSet<RowsetId> = self
                .state
                .lock()
                .versions
                .iter()
                .flat_map(|v| v.rowsets.iter().copied())
                .collect();
            let unused: BTreeSet<RowsetId> = expired
                .iter()
                .flat_map(|v| v.rowsets.iter().copied())
                .filter(|id| !active.contains(id))
                .collect();
            {
                let mut rowsets = self.rowsets.write();
                let mut queue = self.unused_rowsets.lock();
                for id in &unused {
                    if let Some(rowset) = rowsets.remove(id) {
                        queue.push_back(rowset);
                    }
                }
            }
            {
                let mut stats = self.rowset_stats.lock();
                for id in &unused {
                    stats.remove(id);
                }
            }

            let meta = self.ctx.meta();
            for (rssid, end_version) in meta.list_del_vector(self.tablet_id, max_expired + 1) {
                if let Err(e) = meta.delete_del_vector_range(self.tablet_id, rssid, 0, end_version) {
                    warn!(tablet = self.tablet_id, rssid, error = %e, "failed to delete delete vectors");
                }
            }
            info!(
                tablet = self.tablet_id,
                expired = expired.len(),
                max_expired,
                unused_rowsets = unused.len(),
                "remove expired versions"
            );
        }
        self.remove_unused_rowsets();
    }

    /// Delete queued rowsets that nobody reads anymore. Rowsets still referenced stay
    /// queued.
    pub fn remove_unused_rowsets(&self) {
        let mut queue = self.unused_rowsets.lock();
        let mut skipped = vec![];
        while let Some(rowset) = queue.pop_front() {
            if Arc::strong_count(&rowset) > 1 {
                debug!(tablet = self.tablet_id, rowset = rowset.rowset_id(), "rowset still referenced");
                skipped.push(rowset);
                continue;
            }
            for i in 0..rowset.num_segments() as u32 {
                self.ctx
                    .clear_cached_del_vec(self.tablet_id, rowset.rowset_id() + i);
            }
            if let Err(e) =
                self.ctx
                    .meta()
                    .rowset_delete(self.tablet_id, rowset.rowset_id(), rowset.num_segments())
            {
                warn!(tablet = self.tablet_id, rowset = rowset.rowset_id(), error = %e, "failed to delete rowset");
                skipped.push(rowset);
                continue;
            }
            debug!(tablet = self.tablet_id, rowset = rowset.rowset_id(), "rowset removed");
        }
        queue.extend(skipped);
    }

    /// Number of rowsets waiting in the unused queue.
    pub fn num_unused_rowsets(&self) -> usize {
        self.unused_rowsets.lock().len()
    }

    /// Remove all metadata of the tablet. The tablet is unusable afterwards.
    pub fn clear_meta(&self) -> StorageResult<()> {
        self.set_error("tablet dropped");
        self.stop_and_wait_apply_done();
        self.ctx.meta().clear_tablet(self.tablet_id)?;
        self.ctx.index_cache().remove_by_key(&self.tablet_id);
        let rowsets = {
            let mut state = self.state.lock();
            state.versions.clear();
            state.pending_commits.clear();
            state.apply_version_idx = 0;
            std::mem::take(&mut *self.rowsets.write())
        };
        for rowset in rowsets.values() {
            for i in 0..rowset.num_segments() as u32 {
                self.ctx
                    .clear_cached_del_vec(self.tablet_id, rowset.rowset_id() + i);
            }
        }
        self.rowset_stats.lock().clear();
        self.unused_rowsets.lock().clear();
        info!(tablet = self.tablet_id, "tablet meta cleared");
        Ok(())
    }

    /// Seed an empty tablet with the rowsets `base` has applied at major version
    /// `version`. Segments are shared with `base`, delete vectors are copied.
    pub fn load_from_base_tablet(&self, version: u64, base: &TabletUpdates) -> StorageResult<()> {
        self.check_error()?;
        let same_layout = self.schema.num_key_columns() == base.schema.num_key_columns()
            && self
                .schema
                .columns()
                .iter()
                .map(|c| c.data_type)
                .eq(base.schema.columns().iter().map(|c| c.data_type));
        if !same_layout {
            return Err(TracedStorageError::invalid_argument(format!(
                "schema of tablet {} does not match base tablet {}",
                self.tablet_id, base.tablet_id
            )));
        }
        {
            let state = self.state.lock();
            if state.versions.len() != 1 || !state.last()?.rowsets.is_empty() || !state.pending_commits.is_empty() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "tablet {} is not empty, cannot load from base tablet {}",
                    self.tablet_id, base.tablet_id
                )));
            }
        }
        let max_version = base.max_version();
        if max_version.major < version {
            warn!(
                tablet = self.tablet_id,
                base = base.tablet_id,
                version,
                %max_version,
                "base tablet is behind the requested version"
            );
            return Err(TracedStorageError::internal(format!(
                "base tablet {} max version {max_version} < {version}",
                base.tablet_id
            )));
        }
        let (src_rowsets, applied) = base.get_applied_rowsets(version)?;

        // a freshly loaded tablet has nothing worth compacting yet
        self.last_compaction_time_ms.store(unix_millis(), Ordering::Relaxed);

        let mut next_rowset_id: RowsetId = 0;
        let mut rowset_metas = Vec::with_capacity(src_rowsets.len());
        let mut delvecs = vec![];
        for src in &src_rowsets {
            let mut meta = src.meta().clone();
            meta.tablet_id = self.tablet_id;
            meta.rowset_id = next_rowset_id;
            for i in 0..src.num_segments() as u32 {
                let dv = base
                    .ctx
                    .get_del_vec(base.tablet_id, src.rowset_id() + i, applied.major)?
                    .unwrap_or_else(|| DelVector::init(applied.major, &[]));
                delvecs.push((next_rowset_id + i, dv));
            }
            next_rowset_id += (src.num_segments() as u32).max(1);
            rowset_metas.push(meta);
        }

        let updates = TabletUpdatesMeta {
            versions: vec![EditVersionMeta {
                version: applied,
                creation_time: unix_seconds(),
                rowsets: rowset_metas.iter().map(|m| m.rowset_id).collect(),
                rowsetid_add: next_rowset_id,
                ..Default::default()
            }],
            apply_version: applied,
            next_rowset_id,
            next_log_id: 0,
        };
        let tablet_meta = TabletMeta {
            tablet_id: self.tablet_id,
            schema: self.schema.as_ref().clone(),
            updates: updates.clone(),
        };
        self.stop_and_wait_apply_done();
        let reset = self.ctx.meta().reset_tablet(&tablet_meta, &rowset_metas, &delvecs);
        self.apply_stopped.store(false, Ordering::Release);
        reset?;

        for (rssid, _) in &delvecs {
            self.ctx.clear_cached_del_vec(self.tablet_id, *rssid);
        }
        self.ctx.index_cache().remove_by_key(&self.tablet_id);
        self.unused_rowsets.lock().clear();
        self.load(updates)?;
        info!(
            tablet = self.tablet_id,
            base = base.tablet_id,
            version = %applied,
            rowsets = rowset_metas.len(),
            "tablet loaded from base tablet"
        );
        Ok(())
    }
}
