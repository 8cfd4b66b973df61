//! Integration tests that run the API in-process
//!
//! The container runtime is replaced by an in-memory fake so the full
//! request path (routing, lifecycle, reconciliation, error mapping) runs
//! without docker.

use async_trait::async_trait;
use axum_test::TestServer;
use nim_manager::{
    ContainerRuntime, Credentials, ManagerConfig, NimError, NimManager, NimResult,
    ObservedContainer, RunSpec,
    api::routes::{AppState, create_router},
    metrics,
    ports::PortProbe,
    runtime::RunHandle,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, ObservedContainer>,
    runs: Vec<RunSpec>,
    pulls: Vec<String>,
    stops: Vec<String>,
    unreachable: bool,
}

#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    fn unreachable_error(command: &str) -> NimError {
        NimError::RuntimeCommand {
            command: command.to_string(),
            code: Some(1),
            stderr: "Cannot connect to the Docker daemon".to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn login(&self, _registry: &str, _username: &str, _secret: &str) -> NimResult<()> {
        Ok(())
    }

    async fn pull(&self, image: &str) -> NimResult<()> {
        self.state.lock().unwrap().pulls.push(image.to_string());
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> NimResult<RunHandle> {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            spec.name.clone(),
            ObservedContainer {
                name: spec.name.clone(),
                host_port: spec.host_port,
                runtime_id: format!("id-{}", spec.name),
                image: spec.image.clone(),
            },
        );
        state.runs.push(spec.clone());
        Ok(RunHandle { pid: None })
    }

    async fn stop(&self, name: &str) -> NimResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stops.push(name.to_string());
        state.containers.remove(name);
        Ok(())
    }

    async fn list_all(&self) -> NimResult<Vec<ObservedContainer>> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(Self::unreachable_error("docker ps -a"));
        }
        Ok(state.containers.values().cloned().collect())
    }

    fn stop_detached(&self, name: &str) {
        self.state.lock().unwrap().containers.remove(name);
    }
}

/// Every port is free
struct FreePorts;

impl PortProbe for FreePorts {
    fn is_in_use(&self, _port: u16) -> bool {
        false
    }
}

struct TestContext {
    server: TestServer,
    runtime: Arc<FakeRuntime>,
    _temp_dir: TempDir,
}

/// Helper to create a test server with the API
fn create_test_server() -> TestContext {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let config = ManagerConfig {
        base_port: 8000,
        cache_dir: Some(temp_dir.path().join("nimcache")),
        log_dir: temp_dir.path().join("logs"),
        ..Default::default()
    };
    let credentials = Credentials {
        api_key: Some("nvapi-test".to_string()),
        hf_token: None,
    };

    let runtime = Arc::new(FakeRuntime::default());
    let manager = Arc::new(NimManager::with_components(
        config,
        credentials,
        runtime.clone(),
        Arc::new(FreePorts),
    ));

    let state = AppState {
        manager,
        prometheus_handle: get_metrics_handle(),
    };

    let app = create_router(state);
    let server = TestServer::try_new(app).expect("Failed to create test server");

    TestContext {
        server,
        runtime,
        _temp_dir: temp_dir,
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let ctx = create_test_server();

    let response = ctx.server.get("/health").await;

    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let ctx = create_test_server();

    let response = ctx.server.get("/metrics").await;

    assert_eq!(response.status_code(), 200);
    let _text = response.text();
}

#[tokio::test]
async fn test_list_models_all_absent() {
    let ctx = create_test_server();

    let response = ctx.server.get("/models").await;

    assert_eq!(response.status_code(), 200);

    let models: Vec<serde_json::Value> = response.json();
    assert_eq!(models.len(), 4);
    for model in &models {
        assert_eq!(model["status"], "absent");
        assert_eq!(model["owned"], false);
        assert!(model["port"].is_null());
    }
    assert_eq!(models[1]["model"], "FLUX_CANNY");
    assert_eq!(models[1]["variant"], "canny");
}

#[tokio::test]
async fn test_deploy_then_resolve_port() {
    let ctx = create_test_server();

    let response = ctx.server.post("/models/FLUX_CANNY/deploy").await;
    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["model"], "FLUX_CANNY");
    assert_eq!(body["port"], 8000);
    assert_eq!(body["status"], "starting");

    let response = ctx.server.get("/models/FLUX_CANNY/port").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["port"], 8000);

    let response = ctx.server.get("/models/FLUX_CANNY").await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["owned"], true);
    assert_eq!(body["image"], "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0");

    let state = ctx.runtime.state.lock().unwrap();
    assert_eq!(state.pulls.len(), 1);
    assert_eq!(state.runs.len(), 1);
    assert_eq!(
        state.runs[0].env_value("NIM_MODEL_VARIANT"),
        Some("canny")
    );
}

#[tokio::test]
async fn test_deploy_twice_is_noop() {
    let ctx = create_test_server();

    let first: serde_json::Value = ctx.server.post("/models/FLUX_DEV/deploy").await.json();
    let second: serde_json::Value = ctx.server.post("/models/FLUX_DEV/deploy").await.json();

    assert_eq!(first["port"], second["port"]);
    assert_eq!(second["status"], "running");
    assert_eq!(ctx.runtime.state.lock().unwrap().runs.len(), 1);
}

#[tokio::test]
async fn test_two_models_get_distinct_ports() {
    let ctx = create_test_server();

    let a: serde_json::Value = ctx.server.post("/models/FLUX_DEV/deploy").await.json();
    let b: serde_json::Value = ctx.server.post("/models/FLUX_DEPTH/deploy").await.json();

    assert_eq!(a["port"], 8000);
    assert_eq!(b["port"], 8001);
}

#[tokio::test]
async fn test_deploy_with_options() {
    let ctx = create_test_server();

    let response = ctx
        .server
        .post("/models/FLUX_SCHNELL/deploy")
        .json(&json!({
            "skip_pull": true,
            "offloading_policy": "disk",
            "hf_token": "hf_abc"
        }))
        .await;
    assert_eq!(response.status_code(), 200);

    let state = ctx.runtime.state.lock().unwrap();
    assert!(state.pulls.is_empty());
    assert_eq!(state.runs[0].env_value("NIM_OFFLOADING_POLICY"), Some("disk"));
    assert_eq!(state.runs[0].env_value("HF_TOKEN"), Some("hf_abc"));
}

#[tokio::test]
async fn test_unknown_model_is_bad_request() {
    let ctx = create_test_server();

    let response = ctx.server.post("/models/FLUX_PRO/deploy").await;
    assert_eq!(response.status_code(), 400);

    let body: serde_json::Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("FLUX_PRO"));
}

#[tokio::test]
async fn test_port_of_stopped_model_is_not_found() {
    let ctx = create_test_server();

    let response = ctx.server.get("/models/FLUX_DEV/port").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_stop_model() {
    let ctx = create_test_server();

    ctx.server.post("/models/FLUX_DEV/deploy").await;

    let response = ctx.server.post("/models/FLUX_DEV/stop").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "absent");

    let response = ctx.server.get("/models/FLUX_DEV/port").await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(ctx.runtime.state.lock().unwrap().stops, ["FLUX_DEV"]);
}

#[tokio::test]
async fn test_stop_never_started_model_succeeds() {
    let ctx = create_test_server();

    let response = ctx.server.post("/models/FLUX_DEPTH/stop").await;
    assert_eq!(response.status_code(), 200);
    assert!(ctx.runtime.state.lock().unwrap().stops.is_empty());
}

#[tokio::test]
async fn test_orphan_is_reclaimed_on_deploy() {
    let ctx = create_test_server();

    ctx.runtime.state.lock().unwrap().containers.insert(
        "FLUX_DEV".to_string(),
        ObservedContainer {
            name: "FLUX_DEV".to_string(),
            host_port: 5000,
            runtime_id: "left-behind".to_string(),
            image: "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0".to_string(),
        },
    );

    // Before deploying, the orphan's port is reported without touching it
    let body: serde_json::Value = ctx.server.get("/models/FLUX_DEV/port").await.json();
    assert_eq!(body["port"], 5000);

    let body: serde_json::Value = ctx.server.post("/models/FLUX_DEV/deploy").await.json();
    assert_eq!(body["port"], 8000);

    let state = ctx.runtime.state.lock().unwrap();
    assert_eq!(state.stops, ["FLUX_DEV"]);
    assert_eq!(state.containers["FLUX_DEV"].host_port, 8000);
}

#[tokio::test]
async fn test_runtime_failure_is_bad_gateway() {
    let ctx = create_test_server();
    ctx.runtime.state.lock().unwrap().unreachable = true;

    let response = ctx.server.get("/models").await;
    assert_eq!(response.status_code(), 502);

    let body: serde_json::Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("docker ps -a"));
}

#[tokio::test]
async fn test_concurrent_deploys_never_share_a_port() {
    let ctx = create_test_server();

    let responses = futures::future::join_all(
        ["FLUX_DEV", "FLUX_CANNY", "FLUX_DEPTH", "FLUX_SCHNELL"]
            .iter()
            .map(|model| {
                ctx.server
                    .post(&format!("/models/{}/deploy", model))
                    .into_future()
            }),
    )
    .await;

    let mut ports: Vec<u64> = responses
        .iter()
        .map(|r| r.json::<serde_json::Value>()["port"].as_u64().unwrap())
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, [8000, 8001, 8002, 8003]);
}
