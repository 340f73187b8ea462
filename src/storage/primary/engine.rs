// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::compactor::Compactor;
use super::{EngineContext, MetaStore, StorageOptions, TabletSchema, TabletUpdates};
use crate::storage::{StorageResult, TracedStorageError};

/// Owns every tablet and the background compactor.
pub struct StorageEngine {
    ctx: Arc<EngineContext>,

    /// All loaded tablets
    tablets: RwLock<HashMap<u64, Arc<TabletUpdates>>>,

    /// Compactor handler used to cancel compactor run
    #[allow(clippy::type_complexity)]
    compactor_handler: Mutex<(Option<Sender<()>>, Option<JoinHandle<()>>)>,
}

impl StorageEngine {
    /// Open the metadata store and load every tablet in it.
    pub fn open(options: StorageOptions) -> StorageResult<Arc<Self>> {
        let meta = match &options.path {
            Some(path) => MetaStore::open(path, options.enable_fsync)?,
            None => MetaStore::new_mock(),
        };
        let ctx = EngineContext::new(options, meta)?;
        let mut tablets = HashMap::new();
        for tablet_id in ctx.meta().tablet_ids() {
            let Some(meta) = ctx.meta().get_tablet_meta(tablet_id)? else {
                continue;
            };
            let tablet = TabletUpdates::open(ctx.clone(), meta)?;
            if tablet.is_error() {
                warn!(tablet = tablet_id, "tablet loaded in error state");
            }
            tablets.insert(tablet_id, tablet);
        }
        info!(tablets = tablets.len(), "storage engine opened");
        Ok(Arc::new(Self {
            ctx,
            tablets: RwLock::new(tablets),
            compactor_handler: Mutex::new((None, None)),
        }))
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn create_tablet(&self, tablet_id: u64, schema: TabletSchema) -> StorageResult<Arc<TabletUpdates>> {
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&tablet_id) {
            return Err(TracedStorageError::duplicated("tablet", tablet_id));
        }
        let tablet = TabletUpdates::create(self.ctx.clone(), tablet_id, schema)?;
        tablets.insert(tablet_id, tablet.clone());
        info!(tablet = tablet_id, "tablet created");
        Ok(tablet)
    }

    pub fn get_tablet(&self, tablet_id: u64) -> StorageResult<Arc<TabletUpdates>> {
        self.tablets
            .read()
            .get(&tablet_id)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("tablet", tablet_id))
    }

    /// Stop the tablet and remove all of its metadata.
    pub fn drop_tablet(&self, tablet_id: u64) -> StorageResult<()> {
        let Some(tablet) = self.tablets.write().remove(&tablet_id) else {
            return Err(TracedStorageError::not_found("tablet", tablet_id));
        };
        tablet.clear_meta()?;
        info!(tablet = tablet_id, "tablet dropped");
        Ok(())
    }

    /// Ids of all tablets, ascending.
    pub fn tablet_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tablets.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(super) fn tablets(&self) -> Vec<Arc<TabletUpdates>> {
        self.tablets.read().values().cloned().collect()
    }

    /// Start the background compactor. Does nothing if it is already running.
    pub fn start_compactor(self: &Arc<Self>) -> StorageResult<()> {
        let mut handler = self.compactor_handler.lock();
        if handler.1.is_some() {
            return Ok(());
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let compactor = Compactor::new(self.clone(), rx);
        let join = self.ctx.runtime()?.spawn(compactor.run());
        *handler = (Some(tx), Some(join));
        info!("compactor started");
        Ok(())
    }

    /// Stop the compactor and the apply tasks of every tablet.
    ///
    /// Blocks the calling thread, so it must not be called from an async context.
    pub fn shutdown(&self) -> StorageResult<()> {
        let (tx, join) = {
            let mut handler = self.compactor_handler.lock();
            (handler.0.take(), handler.1.take())
        };
        if let Some(tx) = tx {
            info!("shutting down compactor");
            // the compactor may have exited already
            let _ = tx.send(());
        }
        if let Some(join) = join {
            if let Err(e) = self.ctx.runtime()?.block_on(join) {
                warn!(error = %e, "compactor task failed");
            }
        }
        for tablet in self.tablets() {
            tablet.stop_and_wait_apply_done();
        }
        self.ctx.meta().checkpoint()?;
        info!("storage engine shut down");
        Ok(())
    }
}
