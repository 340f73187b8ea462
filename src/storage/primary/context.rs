// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use moka::sync::Cache;
use tokio::runtime::{Handle, Runtime};

use super::cache::ObjectCache;
use super::primary_index::HashPrimaryIndex;
use super::update_state::RowsetUpdateState;
use super::{DelVector, MetaStore, StorageOptions};
use crate::storage::{StorageResult, TracedStorageError};

/// Shared state of every tablet of one storage engine.
pub struct EngineContext {
    options: Arc<StorageOptions>,
    meta: Arc<MetaStore>,
    index_cache: ObjectCache<u64, HashPrimaryIndex>,
    update_state_cache: ObjectCache<(u64, u32), RowsetUpdateState>,
    /// Latest delete vector of each `(tablet, rssid)`.
    delvec_cache: Cache<(u64, u32), Arc<DelVector>>,
    runtime: Option<Runtime>,
}

impl EngineContext {
    pub fn new(options: StorageOptions, meta: MetaStore) -> StorageResult<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.apply_threads.max(1))
            .thread_name("lightrock-storage")
            .enable_time()
            .build()?;
        Ok(Arc::new(Self {
            index_cache: ObjectCache::with_expire(options.index_cache_expire),
            update_state_cache: ObjectCache::with_capacity(options.update_state_cache_capacity),
            delvec_cache: Cache::new(1 << 16),
            options: Arc::new(options),
            meta: Arc::new(meta),
            runtime: Some(runtime),
        }))
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn index_cache(&self) -> &ObjectCache<u64, HashPrimaryIndex> {
        &self.index_cache
    }

    pub fn update_state_cache(&self) -> &ObjectCache<(u64, u32), RowsetUpdateState> {
        &self.update_state_cache
    }

    pub fn runtime(&self) -> StorageResult<Handle> {
        self.runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| TracedStorageError::cancelled("storage runtime is shut down"))
    }

    /// The newest delete vector of a segment. A segment without one has no deletes.
    pub fn get_latest_del_vec(&self, tablet: u64, rssid: u32) -> StorageResult<Arc<DelVector>> {
        if let Some(dv) = self.delvec_cache.get(&(tablet, rssid)) {
            return Ok(dv);
        }
        let dv = Arc::new(self.meta.get_del_vector(tablet, rssid, u64::MAX)?.unwrap_or_default());
        self.delvec_cache.insert((tablet, rssid), dv.clone());
        Ok(dv)
    }

    /// The delete vector of a segment as of major version `version`.
    pub fn get_del_vec(&self, tablet: u64, rssid: u32, version: u64) -> StorageResult<Option<DelVector>> {
        if let Some(dv) = self.delvec_cache.get(&(tablet, rssid)) {
            if dv.version() <= version {
                return Ok(Some(dv.as_ref().clone()));
            }
        }
        self.meta.get_del_vector(tablet, rssid, version)
    }

    pub fn set_cached_del_vec(&self, tablet: u64, rssid: u32, dv: DelVector) {
        self.delvec_cache.insert((tablet, rssid), Arc::new(dv));
    }

    pub fn clear_cached_del_vec(&self, tablet: u64, rssid: u32) {
        self.delvec_cache.invalidate(&(tablet, rssid));
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
