// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use super::{calc_compaction_score, TabletUpdates};
use crate::storage::primary::compaction_state::CompactionState;
use crate::storage::primary::edit_version::{EditVersion, EditVersionInfo};
use crate::storage::primary::primary_index::{DeletesMap, HashPrimaryIndex, PrimaryIndex};
use crate::storage::primary::tablet_meta_manager::del_vector_batch;
use crate::storage::primary::update_state::RowsetUpdateState;
use crate::storage::primary::DelVector;
use crate::storage::{StorageResult, TracedStorageError};

impl TabletUpdates {
    /// Start an apply task unless one is running or nothing is left to apply.
    ///
    /// Must not be called with the state lock held.
    pub(super) fn check_for_apply(&self) {
        if self.apply_stopped.load(Ordering::Acquire) || self.is_error() {
            return;
        }
        let mut running = self.apply_running.lock();
        if *running {
            return;
        }
        {
            let state = self.state.lock();
            if state.apply_version_idx + 1 >= state.versions.len() {
                return;
            }
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let runtime = match self.ctx.runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(tablet = self.tablet_id, error = %e, "cannot schedule apply");
                return;
            }
        };
        *running = true;
        runtime.spawn_blocking(move || this.do_apply());
    }

    /// Apply every committed version in order until caught up, stopped, or in error.
    fn do_apply(&self) {
        loop {
            if self.apply_stopped.load(Ordering::Acquire) || self.is_error() {
                break;
            }
            let next = {
                let state = self.state.lock();
                state.versions.get(state.apply_version_idx + 1).cloned()
            };
            let Some(info) = next else {
                // recheck with the running flag held, a commit may have slipped in
                let mut running = self.apply_running.lock();
                let state = self.state.lock();
                if state.apply_version_idx + 1 < state.versions.len() {
                    continue;
                }
                *running = false;
                self.apply_stopped_cond.notify_all();
                return;
            };
            let result = if info.compaction.is_some() {
                self.apply_compaction_commit(&info)
            } else {
                self.apply_rowset_commit(&info)
            };
            if let Err(e) = result {
                error!(
                    tablet = self.tablet_id,
                    version = %info.version,
                    error = %e,
                    state = %self.debug_string(),
                    "apply failed"
                );
                self.set_error(format!("apply of version {} failed", info.version));
                break;
            }
        }
        let mut running = self.apply_running.lock();
        *running = false;
        self.apply_stopped_cond.notify_all();
    }

    /// Stop scheduling applies and wait for the in-flight one to finish.
    pub fn stop_and_wait_apply_done(&self) {
        self.apply_stopped.store(true, Ordering::Release);
        let mut running = self.apply_running.lock();
        while *running {
            self.apply_stopped_cond.wait(&mut running);
        }
    }

    /// Run `f` on the cached primary index. The index is evicted if `f` fails, since it
    /// may be ahead of the persisted state.
    fn with_index<T>(&self, f: impl FnOnce(&mut HashPrimaryIndex) -> StorageResult<T>) -> StorageResult<T> {
        let handle = self
            .ctx
            .index_cache()
            .get_or_create(self.tablet_id, || HashPrimaryIndex::new(self.tablet_id));
        let result = {
            let mut index = handle.lock();
            f(&mut index).map(|t| (t, index.memory_usage()))
        };
        match result {
            Ok((t, memory)) => {
                handle.update_object_size(memory);
                handle.release();
                Ok(t)
            }
            Err(e) => {
                handle.remove();
                Err(e)
            }
        }
    }

    pub(super) fn apply_rowset_commit(&self, info: &EditVersionInfo) -> StorageResult<()> {
        let version = info.version;
        let Some(&rowset_id) = info.deltas.first() else {
            return Err(TracedStorageError::internal(format!(
                "version {version} has no delta rowset"
            )));
        };
        let Some(rowset) = self.get_rowset(rowset_id) else {
            return Err(TracedStorageError::internal(format!(
                "rowset {rowset_id} of version {version} not found"
            )));
        };
        let num_segments = rowset.num_segments() as u32;

        let new_deletes = self.with_index(|index| {
            index.load(self)?;
            let state_handle = self
                .ctx
                .update_state_cache()
                .get_or_create((self.tablet_id, rowset_id), RowsetUpdateState::default);
            let mut update_state = state_handle.lock();
            if let Err(e) = update_state.load(&rowset, self.schema.num_key_columns()) {
                drop(update_state);
                state_handle.remove();
                return Err(e);
            }

            let mut new_deletes = DeletesMap::new();
            for i in 0..num_segments {
                new_deletes.insert(rowset_id + i, vec![]);
            }
            for (i, keys) in update_state.upserts().iter().enumerate() {
                index.upsert(rowset_id + i as u32, 0, keys, &mut new_deletes);
            }
            index.erase(update_state.deletes(), &mut new_deletes);

            // the state is only needed once
            drop(update_state);
            state_handle.remove();
            Ok(new_deletes)
        })?;

        let mut delvecs = Vec::with_capacity(new_deletes.len());
        for (&rssid, dels) in &new_deletes {
            if (rowset_id..rowset_id + num_segments).contains(&rssid) {
                delvecs.push((rssid, DelVector::init(version.major, dels)));
                continue;
            }
            let old = self.ctx.get_latest_del_vec(self.tablet_id, rssid)?;
            let new = old.add_dels_as_new_version(dels, version.major);
            if new.cardinality() != old.cardinality() + dels.len() {
                let msg = format!(
                    "delete vector cardinality mismatch: tablet {} rssid {} version {}: {} + {} != {}",
                    self.tablet_id,
                    rssid,
                    version,
                    old.cardinality(),
                    dels.len(),
                    new.cardinality()
                );
                error!(state = %self.debug_string(), "{msg}");
                self.ctx.index_cache().remove_by_key(&self.tablet_id);
                return Err(TracedStorageError::corruption(msg));
            }
            delvecs.push((rssid, new));
        }

        let num_delvecs = delvecs.len();
        let total_dels = new_deletes.values().map(Vec::len).sum::<usize>();
        self.persist_apply(version, delvecs, || {
            {
                let mut stats = self.rowset_stats.lock();
                for (&rssid, dels) in &new_deletes {
                    let Some((&id, st)) = stats.range_mut(..=rssid).next_back() else {
                        warn!(tablet = self.tablet_id, rssid, "stats of segment not found");
                        continue;
                    };
                    if rssid >= id + st.num_segments as u32 {
                        warn!(tablet = self.tablet_id, rssid, rowset = id, "segment outside of rowset");
                        continue;
                    }
                    st.num_dels += dels.len();
                    st.compaction_score = calc_compaction_score(st, self.ctx.options().compaction_cost_seek);
                }
            }
            self.update_total_stats(&info.rowsets);
        })
        .inspect_err(|_| {
            self.ctx.index_cache().remove_by_key(&self.tablet_id);
        })?;

        info!(
            tablet = self.tablet_id,
            version = %version,
            rowset = rowset_id,
            segments = num_segments,
            delvecs = num_delvecs,
            deletes = total_dels,
            "apply rowset commit"
        );
        Ok(())
    }

    pub(super) fn apply_compaction_commit(&self, info: &EditVersionInfo) -> StorageResult<()> {
        let version = info.version;
        let Some(compaction) = &info.compaction else {
            return Err(TracedStorageError::internal(format!(
                "version {version} is not a compaction"
            )));
        };
        self.compaction_running.store(true, Ordering::Release);
        let result = self.do_apply_compaction_commit(info, compaction.output);
        self.compaction_running.store(false, Ordering::Release);
        let total_deletes = result?;
        info!(
            tablet = self.tablet_id,
            version = %version,
            inputs = ?compaction.inputs,
            output = compaction.output,
            deletes = total_deletes,
            "apply compaction commit"
        );
        Ok(())
    }

    fn do_apply_compaction_commit(&self, info: &EditVersionInfo, output_id: u32) -> StorageResult<usize> {
        let version = info.version;
        let Some(output) = self.get_rowset(output_id) else {
            return Err(TracedStorageError::internal(format!(
                "compaction output rowset {output_id} not found"
            )));
        };
        let delvecs = self.with_index(|index| {
            index.load(self)?;
            let state = CompactionState::load(&output, self.schema.num_key_columns())?;
            let mut delvecs = Vec::with_capacity(state.segments.len());
            for (i, segment) in state.segments.iter().enumerate() {
                let rssid = output_id + i as u32;
                let mut failed = vec![];
                index.try_replace(rssid, 0, &segment.pkeys, &segment.src_rssids, &mut failed);
                debug!(tablet = self.tablet_id, rssid, deletes = failed.len(), "compaction segment replaced");
                delvecs.push((rssid, DelVector::init(version.major, &failed)));
            }
            Ok(delvecs)
        })?;
        let total_deletes = delvecs.iter().map(|(_, dv)| dv.cardinality()).sum::<usize>();
        self.persist_apply(version, delvecs, || {
            {
                let mut stats = self.rowset_stats.lock();
                if let Some(st) = stats.get_mut(&output_id) {
                    st.num_dels += total_deletes;
                    st.compaction_score = calc_compaction_score(st, self.ctx.options().compaction_cost_seek);
                }
            }
            self.update_total_stats(&info.rowsets);
        })
        .inspect_err(|_| {
            self.ctx.index_cache().remove_by_key(&self.tablet_id);
        })?;
        Ok(total_deletes)
    }

    /// Write the delete vectors and the apply marker in one batch, then advance the
    /// applied version.
    ///
    /// `on_applied` runs after the write and before waiters of the version are woken,
    /// so they observe its effects. It must not take the state lock.
    pub(super) fn persist_apply(
        &self,
        version: EditVersion,
        delvecs: Vec<(u32, DelVector)>,
        on_applied: impl FnOnce(),
    ) -> StorageResult<()> {
        let batch = del_vector_batch(self.tablet_id, &delvecs)?;
        // log ids are handed out under the state lock and must hit the store in order,
        // a snapshot save drops every log entry below `next_log_id`
        let mut state = self.state.lock();
        let expected = state.versions.get(state.apply_version_idx + 1).map(|v| v.version);
        if expected != Some(version) {
            return Err(TracedStorageError::internal(format!(
                "apply version {version} out of order, expected {expected:?}"
            )));
        }
        self.ctx
            .meta()
            .apply_rowset_commit(self.tablet_id, state.next_log_id, version, batch)?;
        for (rssid, dv) in delvecs {
            self.ctx.set_cached_del_vec(self.tablet_id, rssid, dv);
        }
        state.next_log_id += 1;
        on_applied();
        state.apply_version_idx += 1;
        self.apply_version_changed.notify_all();
        Ok(())
    }
}
