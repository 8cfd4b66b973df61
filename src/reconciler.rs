//! Reconciliation of run records against runtime observations
//!
//! The runtime is ground truth. A record only claims ownership over a
//! container the runtime also reports; a container without a record is an
//! orphan from an earlier process.

use crate::error::{NimError, NimResult};
use crate::model::ModelIdentity;
use crate::records::{ContainerStatus, RunRecord};
use crate::runtime::ObservedContainer;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How a model's record relates to what the runtime reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Record and container both present
    Confirmed(ObservedContainer),
    /// Container present without a record
    Orphan(ObservedContainer),
    /// Record present but the container is gone.
    ///
    /// `run` returns before the container exists, so a record that is still
    /// `Starting` also lands here until `ps` lists it. See
    /// [`in_startup_grace`].
    Stale,
    /// Neither present
    Absent,
}

impl Reconciliation {
    /// Whether the model is served by a container this manager owns
    pub fn is_running(&self) -> bool {
        matches!(self, Reconciliation::Confirmed(_))
    }
}

/// The observed container named after `model`, if any
pub fn find_observed(
    model: ModelIdentity,
    observed: &[ObservedContainer],
) -> Option<&ObservedContainer> {
    observed.iter().find(|c| c.name == model.as_str())
}

/// Classify a model given its record and a fresh listing
pub fn classify(
    model: ModelIdentity,
    record: Option<&RunRecord>,
    observed: &[ObservedContainer],
) -> Reconciliation {
    match (record, find_observed(model, observed)) {
        (Some(_), Some(container)) => Reconciliation::Confirmed(container.clone()),
        (None, Some(container)) => Reconciliation::Orphan(container.clone()),
        (Some(_), None) => Reconciliation::Stale,
        (None, None) => Reconciliation::Absent,
    }
}

/// Whether a `Starting` record is young enough that its container may simply
/// not be listed yet
pub fn in_startup_grace(record: &RunRecord, now: DateTime<Utc>, grace: Duration) -> bool {
    if record.status != ContainerStatus::Starting {
        return false;
    }
    match (now - record.started_at).to_std() {
        Ok(age) => age < grace,
        // Clock went backwards
        Err(_) => true,
    }
}

/// Port serving `model`.
///
/// The record wins over the listing: it holds the port chosen at launch,
/// before the container is visible to `ps`. Without a record the observed
/// port is used, which covers reattaching after a manager restart.
pub fn resolve_port(
    model: ModelIdentity,
    record: Option<&RunRecord>,
    observed: &[ObservedContainer],
) -> NimResult<u16> {
    if let Some(record) = record {
        return Ok(record.port);
    }
    find_observed(model, observed)
        .map(|c| c.host_port)
        .ok_or(NimError::NotRunning(model))
}
