//! NIM Manager - container lifecycle manager for NIM image-generation servers
//!
//! Starts, tracks and stops one GPU inference container per model on a single
//! host, reclaims containers orphaned by earlier processes, and resolves the
//! port each model is served on.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod gpu;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod ports;
pub mod reaper;
pub mod reconciler;
pub mod records;
pub mod runtime;
pub mod startup;

pub use client::{GenerateRequest, InferenceClient};
pub use config::{Credentials, ManagerConfig};
pub use error::{NimError, NimResult};
pub use lifecycle::{ModelStatus, NimManager, StartOptions};
pub use model::{ModelIdentity, OffloadingPolicy, Variant};
pub use reaper::Reaper;
pub use records::{ContainerStatus, RunRecord, RunRecords};
pub use runtime::{ContainerRuntime, DockerCli, ObservedContainer, RunSpec};
