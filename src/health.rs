//! Readiness polling for freshly started containers
//!
//! `start` returns as soon as the container is launched. Callers that need a
//! serving endpoint poll here until the model answers its readiness probe or
//! the timeout passes.

use crate::client::InferenceClient;
use crate::error::{NimError, NimResult};
use crate::lifecycle::NimManager;
use crate::model::ModelIdentity;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Wait until `model` reports ready and return its port
pub async fn wait_for_ready(
    manager: &NimManager,
    client: &InferenceClient,
    model: ModelIdentity,
    timeout: Duration,
    poll_interval: Duration,
) -> NimResult<u16> {
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        match manager.get_port(model).await {
            Ok(port) => {
                if client.is_ready(port).await {
                    tracing::info!(
                        model = %model,
                        port = port,
                        attempts = attempts,
                        "NIM is ready"
                    );
                    return Ok(port);
                }
            }
            Err(e @ NimError::NotRunning(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Readiness check failed");
            }
        }

        if Instant::now() + poll_interval > deadline {
            return Err(NimError::ReadyTimeout {
                model,
                timeout_secs: timeout.as_secs(),
            });
        }

        if attempts % 10 == 0 {
            tracing::info!(model = %model, attempts = attempts, "Waiting for NIM to become ready");
        }
        sleep(poll_interval).await;
    }
}
