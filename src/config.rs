//! Configuration structures and loading logic

use crate::error::{NimError, NimResult};
use crate::model::{ModelIdentity, OffloadingPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    /// First host port tried when publishing a container's serving port
    pub base_port: u16,
    pub runtime_binary: String,
    pub registry: String,
    pub registry_username: String,
    /// Root of per-model cache directories. Defaults to `$HOME/nimcache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Where the output of each `docker run` client process is written
    pub log_dir: PathBuf,
    pub shm_size: String,
    /// GPU indices exposed to containers; empty means all
    pub gpu_devices: Vec<u32>,
    /// Upper bound callers should apply when waiting for a container to serve
    pub ready_timeout_secs: u64,
    /// How long a freshly launched container may stay missing from `ps`
    /// before its run record is treated as stale
    pub startup_grace_secs: u64,
    pub offloading_policy: OffloadingPolicy,
    /// Models deployed when the binary starts
    pub deploy: Vec<ModelIdentity>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            base_port: default_base_port(),
            runtime_binary: default_runtime_binary(),
            registry: default_registry(),
            registry_username: default_registry_username(),
            cache_dir: None,
            log_dir: default_log_dir(),
            shm_size: default_shm_size(),
            gpu_devices: Vec::new(),
            ready_timeout_secs: default_ready_timeout(),
            startup_grace_secs: default_startup_grace(),
            offloading_policy: OffloadingPolicy::default(),
            deploy: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("NIM_MANAGER_API_PORT") {
            config.api_port = port.parse().context("Invalid NIM_MANAGER_API_PORT value")?;
        }
        if let Ok(port) = std::env::var("NIM_MANAGER_BASE_PORT") {
            config.base_port = port
                .parse()
                .context("Invalid NIM_MANAGER_BASE_PORT value")?;
        }
        if let Ok(binary) = std::env::var("NIM_RUNTIME_BINARY") {
            config.runtime_binary = binary;
        }
        if let Ok(cache_dir) = std::env::var("NIM_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(cache_dir));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.base_port < 1024 {
            anyhow::bail!("Base port must be >= 1024 (got {})", self.base_port);
        }
        if self.runtime_binary.trim().is_empty() {
            anyhow::bail!("Container runtime binary cannot be empty");
        }
        if self.shm_size.trim().is_empty() {
            anyhow::bail!("Shared memory size cannot be empty");
        }
        if self.ready_timeout_secs == 0 {
            anyhow::bail!("Ready timeout must be greater than zero");
        }

        let mut seen = HashSet::new();
        for model in &self.deploy {
            if !seen.insert(model) {
                anyhow::bail!("Model {} listed more than once in deploy", model);
            }
        }

        Ok(())
    }

    /// Resolve the cache root, failing when no location can be determined
    pub fn cache_root(&self) -> NimResult<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join("nimcache"))
            .ok_or_else(|| {
                NimError::Configuration(
                    "NIM_CACHE_DIR is not set and no home directory was found".to_string(),
                )
            })
    }

    /// Per-model cache directory mounted into the container
    pub fn model_cache_dir(&self, model: ModelIdentity) -> NimResult<PathBuf> {
        Ok(self
            .cache_root()?
            .join(model.as_str())
            .join("latest")
            .join(".cache"))
    }
}

/// Secrets sourced from the environment, never from the config file
#[derive(Clone, Default)]
pub struct Credentials {
    /// Registry credential, also handed to the container for model downloads
    pub api_key: Option<String>,
    /// Auxiliary token for gated model weights
    pub hf_token: Option<String>,
}

impl Credentials {
    /// Read `NGC_API_KEY` and `HF_TOKEN`
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_env("NGC_API_KEY"),
            hf_token: non_empty_env("HF_TOKEN"),
        }
    }

    /// Registry credential, required before pulling or running
    pub fn require_api_key(&self) -> NimResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| NimError::Configuration("NGC_API_KEY is not set".to_string()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("hf_token", &self.hf_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_base_port() -> u16 {
    5000
}
fn default_runtime_binary() -> String {
    "docker".to_string()
}
fn default_registry() -> String {
    "nvcr.io".to_string()
}
fn default_registry_username() -> String {
    "$oauthtoken".to_string()
}
fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("nim-manager").join("logs")
}
fn default_shm_size() -> String {
    "16GB".to_string()
}
fn default_ready_timeout() -> u64 {
    1800
}
fn default_startup_grace() -> u64 {
    120
}
