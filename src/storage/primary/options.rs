// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;
use std::time::Duration;

/// Options for `StorageEngine`
#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// Directory of the metadata store. `None` keeps all metadata in memory.
    pub path: Option<PathBuf>,

    /// Whether to fsync the metadata log after every batch
    pub enable_fsync: bool,

    /// Primary indexes unused for this long are evicted from the index cache
    pub index_cache_expire: Duration,

    /// Number of entries kept in the update-state cache
    pub update_state_cache_capacity: u64,

    /// Worker threads of the engine runtime
    pub apply_threads: usize,

    /// Rows per batch produced by segment iterators
    pub chunk_size: usize,

    /// Upper bound of out-of-order commits buffered per tablet
    pub max_pending_commits: usize,

    /// Rowset lists up to this length are logged in full, longer ones as deltas
    pub full_rowset_list_threshold: usize,

    /// Fixed cost of one extra rowset seek, in bytes
    pub compaction_cost_seek: i64,

    /// Target size (in bytes) of a compaction output
    pub compaction_result_bytes_threshold: i64,

    /// Target row count of a compaction output
    pub compaction_result_rows_threshold: i64,

    /// Minimum time between two compactions of a tablet
    pub compaction_min_interval: Duration,

    /// How often the compactor looks for work
    pub compaction_check_interval: Duration,

    /// Bound of `get_applied_rowsets` waits
    pub version_wait_timeout: Duration,

    /// Bound of the wait after committing a compaction
    pub compaction_wait_timeout: Duration,

    /// Maximum rows of one segment written by `RowsetWriter`
    pub segment_max_rows: usize,
}

impl StorageOptions {
    pub fn default_for_cli() -> Self {
        Self {
            path: Some(PathBuf::new().join("lightrock.db")),
            enable_fsync: true,
            index_cache_expire: Duration::from_secs(360),
            update_state_cache_capacity: 1024,
            apply_threads: 4,
            chunk_size: 4096,
            max_pending_commits: 100,
            full_rowset_list_threshold: 16,
            compaction_cost_seek: 32 * (1 << 20), // 32MB
            compaction_result_bytes_threshold: 1_000_000_000,
            compaction_result_rows_threshold: 10_000_000,
            compaction_min_interval: Duration::from_secs(60),
            compaction_check_interval: Duration::from_secs(10),
            version_wait_timeout: Duration::from_secs(60),
            compaction_wait_timeout: Duration::from_secs(120),
            segment_max_rows: 1 << 20,
        }
    }

    pub fn default_for_test(path: Option<PathBuf>) -> Self {
        Self {
            path,
            enable_fsync: false,
            index_cache_expire: Duration::from_secs(60),
            update_state_cache_capacity: 64,
            apply_threads: 2,
            chunk_size: 1024,
            max_pending_commits: 100,
            full_rowset_list_threshold: 16,
            compaction_cost_seek: 32 * (1 << 20),
            compaction_result_bytes_threshold: 1_000_000_000,
            compaction_result_rows_threshold: 10_000_000,
            compaction_min_interval: Duration::ZERO,
            compaction_check_interval: Duration::from_millis(50),
            version_wait_timeout: Duration::from_secs(10),
            compaction_wait_timeout: Duration::from_secs(10),
            segment_max_rows: 1024,
        }
    }
}
