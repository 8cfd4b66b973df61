//! Models deployed when the binary starts

use crate::client::InferenceClient;
use crate::health;
use crate::lifecycle::{NimManager, StartOptions};
use crate::model::ModelIdentity;
use std::sync::Arc;
use std::time::Duration;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Deploy `models` one by one and spawn a readiness wait for each.
///
/// Meant to run as its own task next to the API server. Aborting it leaves
/// every container deployed so far on record for the reaper.
pub async fn deploy_models(
    manager: Arc<NimManager>,
    models: Vec<ModelIdentity>,
    client: InferenceClient,
) {
    let ready_timeout = Duration::from_secs(manager.config().ready_timeout_secs);

    for model in models {
        match manager.deploy(model, StartOptions::default()).await {
            Ok(port) => {
                tracing::info!(model = %model, port = port, "Deployed at startup");

                let manager = manager.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let result = health::wait_for_ready(
                        &manager,
                        &client,
                        model,
                        ready_timeout,
                        READY_POLL_INTERVAL,
                    )
                    .await;
                    if let Err(e) = result {
                        tracing::error!(model = %model, error = %e, "NIM did not become ready");
                    }
                });
            }
            Err(e) => tracing::error!(model = %model, error = %e, "Failed to deploy at startup"),
        }
    }

    let running = manager.records().count().await;
    tracing::info!(running = running, "Startup deploys finished");
}
