//! GPU detection and device selection
//!
//! Detects available GPUs via nvidia-smi so configured device indices can be
//! checked at startup, and renders the runtime's `--gpus` argument.

use std::process::Command;
use std::sync::OnceLock;

/// Cached GPU information detected at startup
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// Information about available GPUs
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    /// GPU indices visible to this process (from nvidia-smi)
    pub indices: Vec<u32>,
}

impl GpuInfo {
    /// Device indices from `requested` that nvidia-smi did not report
    pub fn missing_devices(&self, requested: &[u32]) -> Vec<u32> {
        requested
            .iter()
            .copied()
            .filter(|id| !self.indices.contains(id))
            .collect()
    }
}

/// Value for `docker run --gpus`. An empty selection exposes every GPU.
pub fn gpus_flag(devices: &[u32]) -> String {
    if devices.is_empty() {
        return "all".to_string();
    }
    let list = devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("\"device={}\"", list)
}

/// Detect available GPUs using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let indices: Vec<u32> = stdout
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect();

            tracing::info!(
                gpu_count = indices.len(),
                indices = ?indices,
                "Detected available GPUs"
            );

            GpuInfo { indices }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, or detect if not initialized
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}
