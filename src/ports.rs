//! Host port allocation for container serving ports
//!
//! Allocation is a liveness probe, not a reservation. Another process can bind
//! a port between the probe and the container launch; callers inside this
//! process are serialized by the lifecycle lock, outside callers are not.

use crate::error::{NimError, NimResult};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// Upper bound on candidates probed per allocation
pub const MAX_PROBE_ATTEMPTS: u16 = 1000;

/// Tells whether something is listening on a local port
pub trait PortProbe: Send + Sync {
    fn is_in_use(&self, port: u16) -> bool;
}

/// Probe that attempts a TCP connection to localhost
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl PortProbe for TcpPortProbe {
    fn is_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// Find a free host port.
///
/// The search starts at `base + bound.len()` and walks upward, skipping ports
/// held by existing run records and ports with a listener.
pub fn allocate(base: u16, bound: &HashSet<u16>, probe: &dyn PortProbe) -> NimResult<u16> {
    let offset = u16::try_from(bound.len()).unwrap_or(u16::MAX);
    let start = base.saturating_add(offset);

    for step in 0..MAX_PROBE_ATTEMPTS {
        let Some(port) = start.checked_add(step) else {
            break;
        };
        if bound.contains(&port) {
            continue;
        }
        if probe.is_in_use(port) {
            tracing::debug!(port = port, "Port in use, probing next");
            continue;
        }
        return Ok(port);
    }

    Err(NimError::PortsExhausted {
        start,
        attempts: MAX_PROBE_ATTEMPTS,
    })
}
