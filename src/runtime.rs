//! Container runtime gateway
//!
//! Issues `login`, `pull`, `run`, `stop` and `ps` against a docker-compatible
//! CLI. Commands are built as argument vectors and never pass through a shell.

use crate::error::{NimError, NimResult};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Port the inference server listens on inside every container
pub const SERVING_PORT: u16 = 8000;

/// Mount point of the model cache inside the container
pub const CONTAINER_CACHE_PATH: &str = "/opt/nim/.cache";

/// Client logs above this size are rotated to `<name>.log.1` on the next run
pub const MAX_LOG_BYTES: u64 = 64 * 1024 * 1024;

/// Matches `<hostAddress>:<hostPort>-><8000>/<proto>` in the `Ports` column
static SERVING_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"[^\s,]*:(\d+)->{}/\w+", SERVING_PORT)).expect("valid port regex")
});

/// A container as reported by the runtime at the time of a single query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedContainer {
    pub name: String,
    pub host_port: u16,
    pub runtime_id: String,
    pub image: String,
}

/// Everything needed to launch one serving container
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub gpus: String,
    pub shm_size: String,
    pub env: Vec<(String, String)>,
    pub cache_dir: PathBuf,
    /// Receives stdout/stderr of the client process when set
    pub log_file: Option<PathBuf>,
}

impl RunSpec {
    /// Arguments following the runtime binary
    pub fn to_args(&self) -> Vec<String> {
        self.build_args(false)
    }

    /// Same as [`RunSpec::to_args`] with environment values masked, for logging
    pub fn redacted_args(&self) -> Vec<String> {
        self.build_args(true)
    }

    /// Value of an injected environment variable
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn build_args(&self, redact: bool) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--gpus".to_string(),
            self.gpus.clone(),
            format!("--name={}", self.name),
            format!("--shm-size={}", self.shm_size),
        ];

        for (key, value) in &self.env {
            args.push("-e".to_string());
            if redact && is_secret(key) {
                args.push(format!("{}=***", key));
            } else {
                args.push(format!("{}={}", key, value));
            }
        }

        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            self.cache_dir.display(),
            CONTAINER_CACHE_PATH
        ));
        args.push("-p".to_string());
        args.push(format!("{}:{}", self.host_port, SERVING_PORT));
        args.push(self.image.clone());
        args
    }
}

fn is_secret(key: &str) -> bool {
    key.ends_with("_KEY") || key.ends_with("_TOKEN")
}

/// Handle to the spawned client process, not to the container
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub pid: Option<u32>,
}

/// Trait for driving the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Authenticate against a registry, secret passed on stdin
    async fn login(&self, registry: &str, username: &str, secret: &str) -> NimResult<()>;

    /// Fetch an image, blocking until the pull finishes
    async fn pull(&self, image: &str) -> NimResult<()>;

    /// Launch a container in the background and return immediately
    async fn run(&self, spec: &RunSpec) -> NimResult<RunHandle>;

    /// Stop a container. A missing container counts as stopped.
    async fn stop(&self, name: &str) -> NimResult<()>;

    /// List containers publishing the serving port
    async fn list_all(&self) -> NimResult<Vec<ObservedContainer>>;

    /// Synchronous best-effort stop for teardown paths that cannot await
    fn stop_detached(&self, name: &str);
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Runtime gateway backed by the docker CLI
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    async fn exec(&self, args: &[&str], stdin: Option<&str>) -> NimResult<Output> {
        let command = self.describe(args);
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|source| NimError::RuntimeUnavailable {
            command: command.clone(),
            source,
        })?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|source| NimError::RuntimeUnavailable {
                    command: command.clone(),
                    source,
                })?;
        }

        child
            .wait_with_output()
            .await
            .map_err(|source| NimError::RuntimeUnavailable { command, source })
    }

    fn check(&self, args: &[&str], output: &Output) -> NimResult<()> {
        if output.status.success() {
            return Ok(());
        }
        Err(NimError::RuntimeCommand {
            command: self.describe(args),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(&self, registry: &str, username: &str, secret: &str) -> NimResult<()> {
        let args = ["login", registry, "--username", username, "--password-stdin"];
        let output = self.exec(&args, Some(secret)).await?;
        self.check(&args, &output)?;

        tracing::info!(registry = %registry, "Logged in to container registry");
        Ok(())
    }

    async fn pull(&self, image: &str) -> NimResult<()> {
        let args = ["pull", image];
        let command = self.describe(&args);

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NimError::RuntimeUnavailable {
                command: command.clone(),
                source,
            })?;

        // Drain stderr concurrently so a chatty pull cannot block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(image = %image, progress = %line, "docker pull");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|source| NimError::RuntimeUnavailable {
                command: command.clone(),
                source,
            })?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(NimError::RuntimeCommand {
                command,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        tracing::info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> NimResult<RunHandle> {
        let args = spec.to_args();
        let command = format!("{} {}", self.binary, spec.redacted_args().join(" "));

        let (stdout, stderr) = match &spec.log_file {
            Some(path) => {
                let file = open_log(path, MAX_LOG_BYTES)
                    .await
                    .and_then(|f| Ok((f.try_clone()?, f)))
                    .map_err(|source| NimError::RuntimeUnavailable {
                        command: command.clone(),
                        source,
                    })?;
                (Stdio::from(file.0), Stdio::from(file.1))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        tracing::info!(command = %command, "Launching container");

        // The child is not supervised; the runtime owns the container from here
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| NimError::RuntimeUnavailable { command, source })?;

        Ok(RunHandle { pid: child.id() })
    }

    async fn stop(&self, name: &str) -> NimResult<()> {
        let args = ["stop", name];
        let output = self.exec(&args, None).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                tracing::info!(container = %name, "Container was already stopped or removed");
                return Ok(());
            }
        }
        self.check(&args, &output)?;

        tracing::info!(container = %name, "Container stopped");
        Ok(())
    }

    async fn list_all(&self) -> NimResult<Vec<ObservedContainer>> {
        let args = ["ps", "-a", "--format", "{{json .}}"];
        let output = self.exec(&args, None).await?;
        self.check(&args, &output)?;

        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn stop_detached(&self, name: &str) {
        let result = std::process::Command::new(&self.binary)
            .args(["stop", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match result {
            Ok(status) if status.success() => {
                tracing::info!(container = %name, "Container stopped");
            }
            Ok(status) => {
                tracing::warn!(container = %name, code = ?status.code(), "Stop returned non-zero");
            }
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Failed to run stop");
            }
        }
    }
}

/// Open a client log for appending, rotating it first when it exceeds
/// `max_bytes`. Only one previous generation is kept.
async fn open_log(path: &Path, max_bytes: u64) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if let Ok(meta) = tokio::fs::metadata(path).await
        && meta.len() > max_bytes
    {
        let mut rotated = path.as_os_str().to_owned();
        rotated.push(".1");
        tokio::fs::rename(path, &rotated).await?;
        tracing::debug!(log = %path.display(), "Rotated container log");
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

// ============================================================================
// `ps` Output Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct PsRecord {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
}

/// Host port bound to the serving port, if any
pub fn extract_host_port(ports: &str) -> Option<u16> {
    SERVING_PORT_RE
        .captures_iter(ports)
        .find_map(|caps| caps.get(1)?.as_str().parse().ok())
}

/// Parse one line of `ps --format '{{json .}}'`.
///
/// Returns `Ok(None)` for containers that do not publish the serving port.
pub fn parse_ps_line(line: &str) -> Result<Option<ObservedContainer>, serde_json::Error> {
    let record: PsRecord = serde_json::from_str(line)?;

    let name = record
        .names
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() {
        return Ok(None);
    }

    Ok(extract_host_port(&record.ports).map(|host_port| ObservedContainer {
        name,
        host_port,
        runtime_id: record.id,
        image: record.image,
    }))
}

/// Parse full `ps` output, skipping lines that cannot be read
pub fn parse_ps_output(stdout: &str) -> Vec<ObservedContainer> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match parse_ps_line(line) {
            Ok(observed) => observed,
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Skipping malformed container record");
                None
            }
        })
        .collect()
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
        RunSpec {
            name: "FLUX_CANNY".to_string(),
            image: "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0".to_string(),
            host_port: 5001,
            gpus: "all".to_string(),
            shm_size: "16GB".to_string(),
            env: vec![
                ("NGC_API_KEY".to_string(), "nvapi-secret".to_string()),
                ("NIM_MODEL_VARIANT".to_string(), "canny".to_string()),
            ],
            cache_dir: PathBuf::from("/home/u/nimcache/FLUX_CANNY/latest/.cache"),
            log_file: None,
        }
    }

    #[test]
    fn test_run_args() {
        let args = spec().to_args();
        assert_eq!(&args[..4], ["run", "--rm", "--gpus", "all"]);
        assert!(args.contains(&"--name=FLUX_CANNY".to_string()));
        assert!(args.contains(&"--shm-size=16GB".to_string()));
        assert!(args.contains(&"NIM_MODEL_VARIANT=canny".to_string()));
        assert!(args.contains(&"5001:8000".to_string()));
        assert!(
            args.contains(&"/home/u/nimcache/FLUX_CANNY/latest/.cache:/opt/nim/.cache".to_string())
        );
        assert_eq!(
            args.last().unwrap(),
            "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0"
        );
    }

    #[test]
    fn test_redacted_args_hide_secrets() {
        let args = spec().redacted_args();
        assert!(args.contains(&"NGC_API_KEY=***".to_string()));
        assert!(args.contains(&"NIM_MODEL_VARIANT=canny".to_string()));
        assert!(!args.iter().any(|a| a.contains("nvapi-secret")));
    }

    #[test]
    fn test_extract_host_port() {
        assert_eq!(
            extract_host_port("0.0.0.0:5000->8000/tcp, :::5000->8000/tcp"),
            Some(5000)
        );
        assert_eq!(extract_host_port("127.0.0.1:6001->8000/tcp"), Some(6001));
        assert_eq!(extract_host_port("[::]:5002->8000/tcp"), Some(5002));
        assert_eq!(extract_host_port("0.0.0.0:5432->5432/tcp"), None);
        assert_eq!(extract_host_port("8000/tcp"), None);
        assert_eq!(extract_host_port(""), None);
    }

    #[test]
    fn test_parse_ps_line() {
        let line = r#"{"Command":"\"/opt/nvidia/nvidia…\"","ID":"3f2a9c","Image":"nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0","Names":"FLUX_DEV","Ports":"0.0.0.0:5000->8000/tcp, :::5000->8000/tcp","State":"running"}"#;
        let observed = parse_ps_line(line).unwrap().unwrap();
        assert_eq!(observed.name, "FLUX_DEV");
        assert_eq!(observed.host_port, 5000);
        assert_eq!(observed.runtime_id, "3f2a9c");
        assert_eq!(
            observed.image,
            "nvcr.io/nim/black-forest-labs/flux.1-dev:1.1.0"
        );
    }

    #[test]
    fn test_parse_ps_line_without_serving_port() {
        let line = r#"{"ID":"aa","Image":"postgres:16","Names":"db","Ports":"0.0.0.0:5432->5432/tcp"}"#;
        assert!(parse_ps_line(line).unwrap().is_none());

        let stopped = r#"{"ID":"bb","Image":"nvcr.io/nim/x","Names":"FLUX_DEV","Ports":""}"#;
        assert!(parse_ps_line(stopped).unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_does_not_abort_batch() {
        let stdout = concat!(
            r#"{"ID":"1","Image":"img","Names":"FLUX_DEV","Ports":"0.0.0.0:5000->8000/tcp"}"#,
            "\n",
            "{not json\n",
            "\n",
            r#"{"ID":"2","Image":"img","Names":"FLUX_CANNY","Ports":"0.0.0.0:5001->8000/tcp"}"#,
            "\n",
        );
        let observed = parse_ps_output(stdout);
        let names: Vec<_> = observed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["FLUX_DEV", "FLUX_CANNY"]);
    }

    #[tokio::test]
    async fn test_open_log_rotates_large_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("FLUX_DEV.log");

        drop(open_log(&path, 16).await.unwrap());
        std::fs::write(&path, "x".repeat(32)).unwrap();

        let mut file = open_log(&path, 16).await.unwrap();
        std::io::Write::write_all(&mut file, b"fresh").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("logs").join("FLUX_DEV.log.1"))
                .unwrap()
                .len(),
            32
        );
    }

    #[tokio::test]
    async fn test_open_log_appends_small_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("FLUX_DEV.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut file = open_log(&path, MAX_LOG_BYTES).await.unwrap();
        std::io::Write::write_all(&mut file, b"new\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
        assert!(!dir.path().join("FLUX_DEV.log.1").exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_runtime_unavailable() {
        let cli = DockerCli::new("/nonexistent/nim-manager-docker");
        let err = cli.list_all().await.unwrap_err();
        assert!(matches!(err, NimError::RuntimeUnavailable { .. }));
    }
}
