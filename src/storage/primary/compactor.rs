// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use tokio::sync::oneshot::Receiver;
use tracing::{debug, error, info, warn};

use super::{StorageEngine, TabletUpdates};

/// Periodically compacts the tablet that benefits most.
pub struct Compactor {
    engine: Arc<StorageEngine>,
    stop: Receiver<()>,
}

impl Compactor {
    pub fn new(engine: Arc<StorageEngine>, stop: Receiver<()>) -> Self {
        Self { engine, stop }
    }

    /// The tablet with the highest positive compaction score.
    fn pick_tablet(&self) -> Option<(Arc<TabletUpdates>, i64)> {
        self.engine
            .tablets()
            .into_iter()
            .map(|t| {
                let score = t.get_compaction_score();
                (t, score)
            })
            .filter(|(_, score)| *score > 0)
            .max_by_key(|(_, score)| *score)
    }

    pub async fn run(mut self) {
        let interval = self.engine.context().options().compaction_check_interval;
        loop {
            tokio::select! {
                _ = &mut self.stop => break,
                _ = tokio::time::sleep(interval) => {}
            }
            for tablet in self.engine.tablets() {
                tablet.remove_unused_rowsets();
            }
            let Some((tablet, score)) = self.pick_tablet() else {
                continue;
            };
            let tablet_id = tablet.tablet_id();
            debug!(tablet = tablet_id, score, "picked tablet for compaction");
            match tokio::task::spawn_blocking(move || tablet.compaction()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(tablet = tablet_id, error = %e, "compaction failed"),
                Err(e) => error!(tablet = tablet_id, error = %e, "compaction task panicked"),
            }
        }
        info!("compactor stopped");
    }
}
