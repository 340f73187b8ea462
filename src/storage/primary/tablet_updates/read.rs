// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use super::TabletUpdates;
use crate::storage::primary::edit_version::EditVersion;
use crate::storage::primary::rowset::{Rowset, SegmentIterator};
use crate::storage::{StorageResult, TracedStorageError};

const WAIT_SLICE: Duration = Duration::from_secs(2);
const SLOW_WAIT: Duration = Duration::from_secs(3);

impl TabletUpdates {
    /// Block until `version` is applied.
    ///
    /// Fails early when `version` is neither committed nor pending, and with
    /// `TimedOut` after `timeout`.
    pub fn wait_for_version(&self, version: EditVersion, timeout: Duration) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.applied()?.version >= version {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            self.apply_version_changed
                .wait_for(&mut state, WAIT_SLICE.min(timeout.max(Duration::from_millis(1))));
            if self.is_error() {
                return Err(TracedStorageError::tablet_in_error(self.tablet_id));
            }
            let elapsed = start.elapsed();
            if state.applied()?.version >= version {
                if elapsed > SLOW_WAIT {
                    warn!(
                        tablet = self.tablet_id,
                        version = %version,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow wait for version"
                    );
                }
                return Ok(());
            }
            let reachable = state.last()?.version >= version
                || state
                    .pending_commits
                    .keys()
                    .next_back()
                    .is_some_and(|max| *max >= version.major);
            if !reachable {
                return Err(TracedStorageError::internal(format!(
                    "tablet {} will never reach version {version}, latest is {}",
                    self.tablet_id,
                    state.last()?.version
                )));
            }
            if elapsed > timeout {
                return Err(TracedStorageError::timed_out(format!(
                    "wait for version {version} of tablet {} after {}ms",
                    self.tablet_id,
                    elapsed.as_millis()
                )));
            }
        }
    }

    /// The rowsets of the newest applied version with major `version`, after waiting
    /// for it to be applied.
    pub fn get_applied_rowsets(&self, version: u64) -> StorageResult<(Vec<Arc<Rowset>>, EditVersion)> {
        self.check_error()?;
        self.wait_for_version(
            EditVersion::new(version, 0),
            self.ctx.options().version_wait_timeout,
        )?;
        let state = self.state.lock();
        let found = state.versions[..=state.apply_version_idx]
            .iter()
            .rev()
            .find(|v| v.version.major == version);
        let Some(info) = found else {
            return Err(TracedStorageError::not_found("version", version));
        };
        let rowsets = self.rowsets.read();
        let mut ret = Vec::with_capacity(info.rowsets.len());
        for id in &info.rowsets {
            let Some(rowset) = rowsets.get(id) else {
                return Err(TracedStorageError::not_found(
                    "rowset",
                    format!("{id} of version {version}"),
                ));
            };
            ret.push(rowset.clone());
        }
        Ok((ret, info.version))
    }

    /// Iterators over every visible row at `version`, one per segment in rowset order.
    pub fn read(&self, version: u64, chunk_size: usize) -> StorageResult<Vec<SegmentIterator>> {
        let (rowsets, _) = self.get_applied_rowsets(version)?;
        let mut iters = vec![];
        for rowset in rowsets {
            let delvecs = (0..rowset.num_segments() as u32)
                .map(|i| self.ctx.get_del_vec(self.tablet_id, rowset.rowset_id() + i, version))
                .collect::<StorageResult<Vec<_>>>()?;
            iters.extend(rowset.get_segment_iterators(delvecs, chunk_size)?);
        }
        Ok(iters)
    }

    /// The rowset committed as major version `version`, if still retained.
    pub fn get_delta_rowset(&self, version: u64) -> Option<Arc<Rowset>> {
        if self.is_error() {
            warn!(tablet = self.tablet_id, "tablet in error state, cannot get delta rowset");
            return None;
        }
        let state = self.state.lock();
        let first = state.versions.first()?.version.major;
        let last = state.versions.last()?.version.major;
        if version < first || version > last {
            return None;
        }
        let info = state.versions.iter().find(|v| v.version.major >= version)?;
        if info.version.major != version || info.version.minor != 0 {
            return None;
        }
        let id = info.deltas.first()?;
        self.get_rowset(*id)
    }
}
