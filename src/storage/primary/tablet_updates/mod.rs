// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Version state of a primary-key tablet.
//!
//! Loads are committed with [`TabletUpdates::rowset_commit`] as consecutive major
//! versions. Each committed version is then applied in the background: the primary
//! index is updated and the delete vectors of the segments holding superseded rows are
//! advanced. Readers pin an applied version through
//! [`TabletUpdates::get_applied_rowsets`].
//!
//! Locks are taken in this order: `apply_running`, `state`, `rowsets`, `rowset_stats`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use itertools::Itertools;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::error;

use super::edit_version::{EditVersion, EditVersionInfo, EditVersionMeta, RowsetId};
use super::primary_index::{IndexSegment, IndexSource};
use super::rowset::{Rowset, RowsetWriter};
use super::schema::TabletSchema;
use super::tablet_meta_manager::{TabletMeta, TabletUpdatesMeta};
use super::EngineContext;
use crate::storage::{StorageResult, TracedStorageError};

mod apply;
mod commit;
mod compaction;
mod load;
mod read;


/// Per-rowset statistics driving compaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowsetStats {
    pub num_segments: usize,
    pub num_rows: usize,
    pub num_dels: usize,
    pub byte_size: usize,
    pub compaction_score: i64,
}

impl RowsetStats {
    pub(super) fn new(rowset: &Rowset, cost_seek: i64) -> Self {
        let mut stats = Self {
            num_segments: rowset.num_segments(),
            num_rows: rowset.num_rows(),
            num_dels: 0,
            byte_size: rowset.data_disk_size(),
            compaction_score: 0,
        };
        stats.compaction_score = calc_compaction_score(&stats, cost_seek);
        stats
    }
}

/// Benefit of rewriting a rowset, in bytes. Higher is better.
pub fn calc_compaction_score(stats: &RowsetStats, cost_seek: i64) -> i64 {
    if stats.num_rows < 10 {
        return cost_seek;
    }
    const COST_RECORD_WRITE: i64 = 1;
    const COST_RECORD_READ: i64 = 4;
    // f64 avoids overflow of byte_size * num_dels
    let delete_bytes = (stats.byte_size as f64 * stats.num_dels as f64 / stats.num_rows as f64) as i64;
    cost_seek + (COST_RECORD_READ + COST_RECORD_WRITE) * delete_bytes
        - COST_RECORD_WRITE * stats.byte_size as i64
}

struct VersionState {
    /// Committed versions, oldest first. Never empty once loaded.
    versions: Vec<Arc<EditVersionInfo>>,
    /// Index into `versions` of the latest applied version.
    apply_version_idx: usize,
    /// Commits that arrived before their predecessor, by major version.
    pending_commits: BTreeMap<u64, Arc<Rowset>>,
    next_rowset_id: RowsetId,
    next_log_id: u64,
}

impl VersionState {
    fn last(&self) -> StorageResult<&Arc<EditVersionInfo>> {
        self.versions
            .last()
            .ok_or_else(|| TracedStorageError::internal("tablet has no version"))
    }

    fn applied(&self) -> StorageResult<&Arc<EditVersionInfo>> {
        self.versions
            .get(self.apply_version_idx)
            .ok_or_else(|| TracedStorageError::internal("tablet has no applied version"))
    }

    fn to_updates_meta(&self) -> StorageResult<TabletUpdatesMeta> {
        Ok(TabletUpdatesMeta {
            versions: self
                .versions
                .iter()
                .map(|v| EditVersionMeta::from(v.as_ref()))
                .collect(),
            apply_version: self.applied()?.version,
            next_rowset_id: self.next_rowset_id,
            next_log_id: self.next_log_id,
        })
    }
}

/// Version, apply and compaction state of one primary-key tablet.
pub struct TabletUpdates {
    tablet_id: u64,
    schema: Arc<TabletSchema>,
    ctx: Arc<EngineContext>,
    this: Weak<TabletUpdates>,

    state: Mutex<VersionState>,
    /// Signalled whenever `apply_version_idx` moves or the tablet enters error.
    apply_version_changed: Condvar,

    rowsets: RwLock<HashMap<RowsetId, Arc<Rowset>>>,
    rowset_stats: Mutex<BTreeMap<RowsetId, RowsetStats>>,
    /// Rowsets no version refers to, waiting for their last reader.
    unused_rowsets: Mutex<VecDeque<Arc<Rowset>>>,

    /// Whether an apply task is in flight.
    apply_running: Mutex<bool>,
    apply_stopped_cond: Condvar,
    apply_stopped: AtomicBool,

    compaction_running: AtomicBool,
    last_compaction_time_ms: AtomicI64,

    error: AtomicBool,

    cur_total_rows: AtomicUsize,
    cur_total_dels: AtomicUsize,
}

impl TabletUpdates {
    /// Persist a new tablet at version 1 with no rowsets, and open it.
    pub fn create(ctx: Arc<EngineContext>, tablet_id: u64, schema: TabletSchema) -> StorageResult<Arc<Self>> {
        if ctx.meta().get_tablet_meta(tablet_id)?.is_some() {
            return Err(TracedStorageError::duplicated("tablet", tablet_id));
        }
        let meta = TabletMeta {
            tablet_id,
            schema,
            updates: TabletUpdatesMeta {
                versions: vec![EditVersionMeta {
                    version: EditVersion::new(1, 0),
                    creation_time: super::edit_version::unix_seconds(),
                    ..Default::default()
                }],
                apply_version: EditVersion::new(1, 0),
                next_rowset_id: 0,
                next_log_id: 0,
            },
        };
        ctx.meta().save_tablet_meta(&meta)?;
        Self::open(ctx, meta)
    }

    /// Open a persisted tablet, replaying its log.
    pub fn open(ctx: Arc<EngineContext>, meta: TabletMeta) -> StorageResult<Arc<Self>> {
        let tablet = Arc::new_cyclic(|this| TabletUpdates {
            tablet_id: meta.tablet_id,
            schema: Arc::new(meta.schema.clone()),
            ctx,
            this: this.clone(),
            state: Mutex::new(VersionState {
                versions: vec![],
                apply_version_idx: 0,
                pending_commits: BTreeMap::new(),
                next_rowset_id: 0,
                next_log_id: 0,
            }),
            apply_version_changed: Condvar::new(),
            rowsets: RwLock::new(HashMap::new()),
            rowset_stats: Mutex::new(BTreeMap::new()),
            unused_rowsets: Mutex::new(VecDeque::new()),
            apply_running: Mutex::new(false),
            apply_stopped_cond: Condvar::new(),
            apply_stopped: AtomicBool::new(false),
            compaction_running: AtomicBool::new(false),
            last_compaction_time_ms: AtomicI64::new(0),
            error: AtomicBool::new(false),
            cur_total_rows: AtomicUsize::new(0),
            cur_total_dels: AtomicUsize::new(0),
        });
        tablet.load(meta.updates)?;
        Ok(tablet)
    }

    pub fn tablet_id(&self) -> u64 {
        self.tablet_id
    }

    pub fn schema(&self) -> &Arc<TabletSchema> {
        &self.schema
    }

    /// A writer producing rowsets for this tablet.
    pub fn new_writer(&self) -> RowsetWriter {
        RowsetWriter::new(
            self.tablet_id,
            self.schema.clone(),
            self.ctx.options().segment_max_rows,
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Enter the sticky error state. Every waiter is woken.
    pub fn set_error(&self, reason: impl std::fmt::Display) {
        if !self.error.swap(true, Ordering::AcqRel) {
            error!(tablet = self.tablet_id, %reason, "tablet enters error state");
        }
        // take the lock so waiters cannot miss the wakeup between check and wait
        let _state = self.state.lock();
        self.apply_version_changed.notify_all();
    }

    fn check_error(&self) -> StorageResult<()> {
        if self.is_error() {
            return Err(TracedStorageError::tablet_in_error(self.tablet_id));
        }
        Ok(())
    }

    fn get_rowset(&self, rowset_id: RowsetId) -> Option<Arc<Rowset>> {
        self.rowsets.read().get(&rowset_id).cloned()
    }

    /// Number of rows in the latest version, including deleted ones.
    pub fn num_rows(&self) -> usize {
        self.last_rowsets_stats().map(|(rows, _, _)| rows).unwrap_or(0)
    }

    /// Bytes of the latest version.
    pub fn data_size(&self) -> usize {
        self.last_rowsets_stats().map(|(_, _, bytes)| bytes).unwrap_or(0)
    }

    fn last_rowsets_stats(&self) -> Option<(usize, usize, usize)> {
        let rowsets = self.state.lock().last().ok()?.rowsets.clone();
        let stats = self.rowset_stats.lock();
        Some(rowsets.iter().filter_map(|id| stats.get(id)).fold(
            (0, 0, 0),
            |(rows, dels, bytes), s| (rows + s.num_rows, dels + s.num_dels, bytes + s.byte_size),
        ))
    }

    /// Rowsets referenced by the latest version.
    pub fn num_rowsets(&self) -> usize {
        self.state.lock().last().map_or(0, |v| v.rowsets.len())
    }

    /// Rowsets in the latest version plus pending commits.
    pub fn version_count(&self) -> usize {
        let state = self.state.lock();
        state.pending_commits.len() + state.last().map_or(0, |v| v.rowsets.len())
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().pending_commits.len()
    }

    /// The latest committed version.
    pub fn max_version(&self) -> EditVersion {
        self.state.lock().last().map(|v| v.version).unwrap_or_default()
    }

    pub fn applied_version(&self) -> EditVersion {
        self.state.lock().applied().map(|v| v.version).unwrap_or_default()
    }

    /// All retained versions, oldest first.
    pub fn versions(&self) -> Vec<EditVersion> {
        self.state.lock().versions.iter().map(|v| v.version).collect()
    }

    pub fn rowset_stats(&self, rowset_id: RowsetId) -> Option<RowsetStats> {
        self.rowset_stats.lock().get(&rowset_id).cloned()
    }

    /// Total `(rows, deletes)` of the given rowsets.
    pub fn get_rowsets_total_stats(&self, rowsets: &[RowsetId]) -> StorageResult<(usize, usize)> {
        let stats = self.rowset_stats.lock();
        let mut total = (0, 0);
        for id in rowsets {
            let Some(s) = stats.get(id) else {
                return Err(TracedStorageError::internal(format!(
                    "stats of rowset {id} not found in tablet {}",
                    self.tablet_id
                )));
            };
            total.0 += s.num_rows;
            total.1 += s.num_dels;
        }
        Ok(total)
    }

    /// Rows and deletes of the applied version, refreshed after every apply.
    pub fn total_stats(&self) -> (usize, usize) {
        (
            self.cur_total_rows.load(Ordering::Relaxed),
            self.cur_total_dels.load(Ordering::Relaxed),
        )
    }

    fn update_total_stats(&self, rowsets: &[RowsetId]) {
        let stats = self.rowset_stats.lock();
        let (rows, dels) = rowsets
            .iter()
            .filter_map(|id| stats.get(id))
            .fold((0, 0), |(r, d), s| (r + s.num_rows, d + s.num_dels));
        self.cur_total_rows.store(rows, Ordering::Relaxed);
        self.cur_total_dels.store(dels, Ordering::Relaxed);
    }

    pub fn debug_string(&self) -> String {
        let state = self.state.lock();
        let mut s = String::new();
        let (first, last) = match (state.versions.first(), state.versions.last()) {
            (Some(first), Some(last)) => (first.version, last.version),
            _ => return format!("tablet:{} <no version>", self.tablet_id),
        };
        let applied = state
            .applied()
            .map(|v| v.version)
            .unwrap_or_default();
        let _ = write!(
            s,
            "tablet:{} #version:{} [{} {}@{} {}] pending:{}",
            self.tablet_id,
            state.versions.len(),
            first,
            applied,
            state.apply_version_idx,
            last,
            state
                .pending_commits
                .keys()
                .map(|v| format!("{v},"))
                .join("")
        );
        let rowsets = state.versions.last().map(|v| v.rowsets.clone()).unwrap_or_default();
        drop(state);

        let _ = write!(s, " rowsets:{}", rowsets.len());
        let stats = self.rowset_stats.lock();
        let describe = |id: &RowsetId| match stats.get(id) {
            Some(st) => format!(
                "[{}/{}/{}/{}/{}/{}]",
                id, st.num_segments, st.num_rows, st.num_dels, st.byte_size, st.compaction_score
            ),
            None => format!("[{id}/?]"),
        };
        s.push_str(" [id/seg/row/del/byte/score]: ");
        if rowsets.len() <= 20 {
            s.push_str(&rowsets.iter().map(describe).join(","));
        } else {
            s.push_str(&rowsets[..10].iter().map(describe).join(","));
            s.push_str(",...,");
            s.push_str(&rowsets[rowsets.len() - 10..].iter().map(describe).join(","));
        }
        s
    }
}

impl IndexSource for TabletUpdates {
    fn tablet_id(&self) -> u64 {
        self.tablet_id
    }

    fn num_key_columns(&self) -> usize {
        self.schema.num_key_columns()
    }

    fn applied_segments(&self) -> StorageResult<Vec<IndexSegment>> {
        let rowset_ids = self.state.lock().applied()?.rowsets.clone();
        let mut segments = vec![];
        for id in rowset_ids {
            let Some(rowset) = self.get_rowset(id) else {
                return Err(TracedStorageError::internal(format!(
                    "applied rowset {id} of tablet {} not found",
                    self.tablet_id
                )));
            };
            for (i, segment) in rowset.segments().iter().enumerate() {
                let rssid = id + i as u32;
                let delvec = self.ctx.get_latest_del_vec(self.tablet_id, rssid)?;
                segments.push(IndexSegment {
                    rssid,
                    segment: segment.clone(),
                    delvec: (!delvec.is_empty()).then(|| delvec.as_ref().clone()),
                });
            }
        }
        Ok(segments)
    }
}
