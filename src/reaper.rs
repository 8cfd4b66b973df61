//! Exit-time cleanup of containers this process started
//!
//! Call [`Reaper::shutdown`] on the normal exit path. If the guard is dropped
//! without it, containers still on record are stopped synchronously.

use crate::lifecycle::NimManager;
use futures::future::join_all;
use std::sync::Arc;

/// Scoped guard that stops every owned container when released
pub struct Reaper {
    manager: Arc<NimManager>,
    released: bool,
}

impl Reaper {
    /// Take responsibility for the manager's containers
    pub fn new(manager: Arc<NimManager>) -> Self {
        Self {
            manager,
            released: false,
        }
    }

    /// Stop every recorded container concurrently and clear the records.
    ///
    /// Failures are logged, never returned. Returns how many containers were
    /// stopped successfully.
    pub async fn shutdown(&mut self) -> usize {
        self.released = true;

        let records = self.manager.records().drain().await;
        if records.is_empty() {
            return 0;
        }

        let models: Vec<_> = records.iter().map(|r| r.model.as_str()).collect();
        tracing::info!(models = ?models, "Cleaning up managed NIM containers");

        let runtime = self.manager.runtime();
        let results = join_all(records.iter().map(|record| async move {
            (record.model, runtime.stop(record.model.as_str()).await)
        }))
        .await;

        let mut stopped = 0;
        for (model, result) in results {
            match result {
                Ok(()) => {
                    stopped += 1;
                    crate::metrics::record_container_stopped(model.as_str(), true);
                }
                Err(e) => {
                    tracing::error!(
                        model = %model,
                        error = %e,
                        "Failed to stop container during cleanup"
                    );
                }
            }
        }
        stopped
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Some(records) = self.manager.records().try_drain() else {
            tracing::warn!("Run records locked during teardown, skipping cleanup");
            return;
        };

        for record in records {
            tracing::info!(model = %record.model, "Stopping NIM during teardown");
            self.manager.runtime().stop_detached(record.model.as_str());
        }
    }
}
