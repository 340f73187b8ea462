// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{info, warn};

use super::{RowsetStats, TabletUpdates, VersionState};
use crate::storage::primary::edit_version::{unix_seconds, EditVersion, EditVersionInfo, EditVersionMeta};
use crate::storage::primary::rowset::Rowset;
use crate::storage::{StorageResult, TracedStorageError};

impl TabletUpdates {
    /// Commit `rowset` as major version `version`.
    ///
    /// Versions at or below the latest commit are ignored. Versions beyond the next one
    /// are persisted as pending and committed once their predecessors arrive.
    pub fn rowset_commit(&self, version: u64, rowset: Arc<Rowset>) -> StorageResult<()> {
        self.check_error()?;
        {
            let mut state = self.state.lock();
            let last = state.last()?.version;
            if version <= last.major {
                warn!(
                    tablet = self.tablet_id,
                    version,
                    latest = %last,
                    "ignore rowset commit of an old version"
                );
                // a pending copy may have been persisted before the version got committed
                if let Err(e) = self.ctx.meta().remove_pending_rowset(self.tablet_id, version) {
                    warn!(tablet = self.tablet_id, version, error = %e, "failed to remove ignored rowset");
                }
                return Ok(());
            }
            if version > last.major + 1 {
                if state.pending_commits.len() > self.ctx.options().max_pending_commits {
                    return Err(TracedStorageError::internal(format!(
                        "too many pending commits: tablet {} version {} pending {}",
                        self.tablet_id,
                        version,
                        state.pending_commits.len()
                    )));
                }
                if state.pending_commits.contains_key(&version) {
                    warn!(tablet = self.tablet_id, version, "duplicated pending commit ignored");
                    return Ok(());
                }
                self.ctx
                    .meta()
                    .pending_rowset_commit(self.tablet_id, version, rowset.meta())?;
                state.pending_commits.insert(version, rowset);
                info!(
                    tablet = self.tablet_id,
                    version,
                    latest = %last,
                    pending = state.pending_commits.len(),
                    "add pending commit"
                );
            } else {
                self.rowset_commit_unlocked(&mut state, version, &rowset)?;
                self.try_commit_pendings(&mut state);
            }
        }
        self.check_for_apply();
        Ok(())
    }

    /// Append `version` to the log. Nothing in memory changes unless the metadata write
    /// succeeds.
    fn rowset_commit_unlocked(
        &self,
        state: &mut VersionState,
        version: u64,
        rowset: &Rowset,
    ) -> StorageResult<()> {
        let rowset_id = state.next_rowset_id;
        let mut rowsets = state.last()?.rowsets.clone();
        rowsets.push(rowset_id);

        let creation_time = unix_seconds();
        let mut edit = EditVersionMeta {
            version: EditVersion::new(version, 0),
            creation_time,
            deltas: vec![rowset_id],
            rowsetid_add: (rowset.num_segments() as u32).max(1),
            ..Default::default()
        };
        if rowsets.len() <= self.ctx.options().full_rowset_list_threshold {
            edit.rowsets = rowsets.clone();
        } else {
            edit.rowsets_add = vec![rowset_id];
        }

        let committed = Arc::new(rowset.make_commit(version, rowset_id));
        self.ctx
            .meta()
            .rowset_commit(self.tablet_id, state.next_log_id, &edit, committed.meta())?;

        state.next_log_id += 1;
        state.next_rowset_id += edit.rowsetid_add;
        state.versions.push(Arc::new(EditVersionInfo {
            version: edit.version,
            creation_time,
            rowsets,
            deltas: edit.deltas.clone(),
            compaction: None,
        }));
        self.rowsets.write().insert(rowset_id, committed.clone());
        self.rowset_stats.lock().insert(
            rowset_id,
            RowsetStats::new(&committed, self.ctx.options().compaction_cost_seek),
        );
        info!(
            tablet = self.tablet_id,
            version = %edit.version,
            rowset = rowset_id,
            segments = committed.num_segments(),
            rows = committed.num_rows(),
            deletes = committed.delete_keys().map_or(0, |k| k.cardinality()),
            bytes = committed.data_disk_size(),
            "rowset commit"
        );
        Ok(())
    }

    /// Promote pending commits that now directly follow the latest version.
    pub(super) fn try_commit_pendings(&self, state: &mut VersionState) {
        while let Some(version) = state.pending_commits.keys().next().copied() {
            let Ok(last) = state.last().map(|v| v.version.major) else {
                return;
            };
            if version <= last {
                state.pending_commits.remove(&version);
                if let Err(e) = self.ctx.meta().remove_pending_rowset(self.tablet_id, version) {
                    warn!(tablet = self.tablet_id, version, error = %e, "failed to remove pending rowset");
                }
                continue;
            }
            if version != last + 1 {
                break;
            }
            let Some(rowset) = state.pending_commits.remove(&version) else {
                break;
            };
            if let Err(e) = self.rowset_commit_unlocked(state, version, &rowset) {
                warn!(tablet = self.tablet_id, version, error = %e, "failed to commit pending rowset");
                state.pending_commits.insert(version, rowset);
                break;
            }
        }
        if !state.pending_commits.is_empty() {
            info!(
                tablet = self.tablet_id,
                pending = %state.pending_commits.keys().join(","),
                "pending commits remain"
            );
        }
    }
}
