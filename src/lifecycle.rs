//! Container lifecycle: pull, start, verify, stop

use crate::config::{Credentials, ManagerConfig};
use crate::error::{NimError, NimResult};
use crate::model::{ModelIdentity, OffloadingPolicy, Variant};
use crate::ports::{self, PortProbe, TcpPortProbe};
use crate::reconciler::{self, Reconciliation};
use crate::records::{ContainerStatus, RunRecord, RunRecords};
use crate::runtime::{ContainerRuntime, DockerCli, ObservedContainer, RunSpec};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-call launch options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    /// Overrides the configured offloading policy
    pub offloading_policy: Option<OffloadingPolicy>,
    /// Overrides `HF_TOKEN` from the environment
    pub hf_token: Option<String>,
    /// Skip login and pull when the image is known to be present
    pub skip_pull: bool,
}

/// Point-in-time view of one model for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model: ModelIdentity,
    pub variant: Variant,
    pub image: &'static str,
    pub status: ContainerStatus,
    pub port: Option<u16>,
    pub runtime_id: Option<String>,
    /// Whether this manager holds a run record for the model
    pub owned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Owns the run records and drives the container runtime.
///
/// Operations that can change records (`start`, `deploy`, `stop`,
/// `is_running`) are serialized so two callers never race on the same
/// model or pick the same port.
pub struct NimManager {
    config: ManagerConfig,
    credentials: Credentials,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn PortProbe>,
    records: Arc<RunRecords>,
    lifecycle: Mutex<()>,
}

impl NimManager {
    /// Create a manager driving the configured runtime binary
    pub fn new(config: ManagerConfig, credentials: Credentials) -> Self {
        let runtime = Arc::new(DockerCli::new(config.runtime_binary.clone()));
        Self::with_components(config, credentials, runtime, Arc::new(TcpPortProbe::default()))
    }

    /// Create a manager with custom runtime and port probe
    pub fn with_components(
        config: ManagerConfig,
        credentials: Credentials,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            config,
            credentials,
            runtime,
            probe,
            records: Arc::new(RunRecords::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<RunRecords> {
        &self.records
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Log in to the registry and pull the model's image
    pub async fn pull_image(&self, model: ModelIdentity) -> NimResult<()> {
        let api_key = self.credentials.require_api_key()?;

        self.runtime
            .login(&self.config.registry, &self.config.registry_username, api_key)
            .await?;

        tracing::info!(model = %model, image = model.image(), "Pulling image");
        if let Err(e) = self.runtime.pull(model.image()).await {
            crate::metrics::record_pull_failure(model.as_str());
            return Err(e);
        }
        Ok(())
    }

    /// Pull the image unless told otherwise, then start the container.
    /// Returns the serving port.
    pub async fn deploy(&self, model: ModelIdentity, options: StartOptions) -> NimResult<u16> {
        let _guard = self.lifecycle.lock().await;
        let pull = !options.skip_pull;
        self.launch(model, &options, pull).await
    }

    /// Start the container without pulling. Returns the serving port.
    pub async fn start(&self, model: ModelIdentity, options: StartOptions) -> NimResult<u16> {
        let _guard = self.lifecycle.lock().await;
        self.launch(model, &options, false).await
    }

    /// Whether the model is served by a container this manager owns.
    ///
    /// An orphaned container under the model's name is force-stopped and
    /// reported as not running. A record whose container vanished is purged
    /// once it is past the startup grace period.
    pub async fn is_running(&self, model: ModelIdentity) -> NimResult<bool> {
        let _guard = self.lifecycle.lock().await;
        Ok(self.reconcile(model).await?.is_running())
    }

    /// Port serving `model`, preferring the port recorded at launch
    pub async fn get_port(&self, model: ModelIdentity) -> NimResult<u16> {
        if let Some(record) = self.records.get(model).await {
            return Ok(record.port);
        }
        let observed = self.runtime.list_all().await?;
        reconciler::resolve_port(model, None, &observed)
    }

    /// Stop the model's container and drop its record.
    ///
    /// Without `force` and without a record, the runtime is asked first and
    /// an absent container counts as already stopped. A recorded container is
    /// always stopped, since it may still be starting and not yet listed.
    pub async fn stop(&self, model: ModelIdentity, force: bool) -> NimResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(model, force).await
    }

    /// Status of one model, without side effects on orphans
    pub async fn status(&self, model: ModelIdentity) -> NimResult<ModelStatus> {
        let observed = self.runtime.list_all().await?;
        let record = self.records.get(model).await;
        Ok(build_status(model, record.as_ref(), &observed))
    }

    /// Status of every known model from a single listing
    pub async fn statuses(&self) -> NimResult<Vec<ModelStatus>> {
        let observed = self.runtime.list_all().await?;
        let mut statuses = Vec::with_capacity(ModelIdentity::ALL.len());
        for model in ModelIdentity::ALL {
            let record = self.records.get(model).await;
            statuses.push(build_status(model, record.as_ref(), &observed));
        }
        Ok(statuses)
    }

    async fn launch(
        &self,
        model: ModelIdentity,
        options: &StartOptions,
        pull: bool,
    ) -> NimResult<u16> {
        let state = self.reconcile(model).await?;
        if let Some(record) = self.records.get(model).await {
            if state.is_running() {
                tracing::info!(model = %model, "NIM is already running");
            } else {
                tracing::info!(model = %model, port = record.port, "NIM is still starting");
            }
            return Ok(record.port);
        }

        if pull {
            self.pull_image(model).await?;
        }

        let api_key = self.credentials.require_api_key()?.to_string();
        let cache_dir = self.config.model_cache_dir(model)?;
        tokio::fs::create_dir_all(&cache_dir).await.map_err(|e| {
            NimError::Configuration(format!(
                "Cannot create cache directory {:?}: {}",
                cache_dir, e
            ))
        })?;

        let bound = self.records.bound_ports().await;
        let port = ports::allocate(self.config.base_port, &bound, self.probe.as_ref())?;

        let policy = options
            .offloading_policy
            .unwrap_or(self.config.offloading_policy);
        let hf_token = options
            .hf_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| self.credentials.hf_token.clone());

        let mut env = vec![
            ("NGC_API_KEY".to_string(), api_key),
            ("NIM_RELAX_MEM_CONSTRAINTS".to_string(), "1".to_string()),
            (
                "NIM_OFFLOADING_POLICY".to_string(),
                policy.env_value().to_string(),
            ),
            (
                "NIM_MODEL_VARIANT".to_string(),
                model.variant().as_str().to_string(),
            ),
        ];
        if let Some(token) = hf_token {
            env.push(("HF_TOKEN".to_string(), token));
        }

        let spec = RunSpec {
            name: model.as_str().to_string(),
            image: model.image().to_string(),
            host_port: port,
            gpus: crate::gpu::gpus_flag(&self.config.gpu_devices),
            shm_size: self.config.shm_size.clone(),
            env,
            cache_dir,
            log_file: Some(self.config.log_dir.join(format!("{}.log", model))),
        };

        let handle = self.runtime.run(&spec).await?;

        if !self
            .records
            .insert(RunRecord::new(model, port, handle.pid))
            .await
        {
            tracing::warn!(model = %model, "Run record already present after launch");
        }

        crate::metrics::record_container_started(model.as_str(), port);
        tracing::info!(
            model = %model,
            port = port,
            variant = %model.variant(),
            pid = ?handle.pid,
            "NIM container starting"
        );

        Ok(port)
    }

    async fn reconcile(&self, model: ModelIdentity) -> NimResult<Reconciliation> {
        let observed = self.runtime.list_all().await?;
        let record = self.records.get(model).await;
        let result = reconciler::classify(model, record.as_ref(), &observed);

        match &result {
            Reconciliation::Confirmed(container) => {
                let runtime_id = container.runtime_id.clone();
                self.records
                    .update(model, |r| {
                        if r.status == ContainerStatus::Starting {
                            r.status = ContainerStatus::Running;
                        }
                        r.runtime_id = Some(runtime_id);
                    })
                    .await;
            }
            Reconciliation::Orphan(container) => {
                tracing::warn!(
                    model = %model,
                    port = container.host_port,
                    runtime_id = %container.runtime_id,
                    "Found an orphaned container, stopping it before starting a new one"
                );
                crate::metrics::record_orphan_reclaimed(model.as_str());
                self.stop_locked(model, true).await?;
            }
            Reconciliation::Stale => {
                let grace = Duration::from_secs(self.config.startup_grace_secs);
                let pending = record
                    .as_ref()
                    .is_some_and(|r| reconciler::in_startup_grace(r, Utc::now(), grace));
                if pending {
                    tracing::debug!(model = %model, "Container not listed yet, keeping run record");
                } else {
                    tracing::warn!(model = %model, "Container is gone, purging stale run record");
                    self.records.remove(model).await;
                }
            }
            Reconciliation::Absent => {}
        }

        Ok(result)
    }

    async fn stop_locked(&self, model: ModelIdentity, force: bool) -> NimResult<()> {
        // A recorded container may not be listed yet, so it is always stopped
        if !force && self.records.get(model).await.is_none() {
            let observed = self.runtime.list_all().await?;
            if reconciler::find_observed(model, &observed).is_none() {
                tracing::info!(model = %model, "NIM container is not running");
                return Ok(());
            }
        }

        self.records
            .update(model, |r| r.status = ContainerStatus::Stopping)
            .await;

        let result = self.runtime.stop(model.as_str()).await;
        self.records.remove(model).await;
        result?;

        crate::metrics::record_container_stopped(model.as_str(), force);
        tracing::info!(model = %model, force = force, "Stopped NIM");
        Ok(())
    }
}

fn build_status(
    model: ModelIdentity,
    record: Option<&RunRecord>,
    observed: &[ObservedContainer],
) -> ModelStatus {
    let container = reconciler::find_observed(model, observed);
    let status = match (record, container) {
        (Some(r), _) => r.status,
        (None, Some(_)) => ContainerStatus::Running,
        (None, None) => ContainerStatus::Absent,
    };

    ModelStatus {
        model,
        variant: model.variant(),
        image: model.image(),
        status,
        port: reconciler::resolve_port(model, record, observed).ok(),
        runtime_id: record
            .and_then(|r| r.runtime_id.clone())
            .or_else(|| container.map(|c| c.runtime_id.clone())),
        owned: record.is_some(),
        started_at: record.map(|r| r.started_at),
    }
}
