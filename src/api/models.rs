//! API request and response models

use crate::model::ModelIdentity;
use crate::records::ContainerStatus;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Result of a deploy call
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub model: ModelIdentity,
    pub port: u16,
    pub status: ContainerStatus,
}

/// Result of a stop call
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub model: ModelIdentity,
    pub status: ContainerStatus,
}

/// Port lookup result
#[derive(Debug, Serialize, Deserialize)]
pub struct PortResponse {
    pub model: ModelIdentity,
    pub port: u16,
}
