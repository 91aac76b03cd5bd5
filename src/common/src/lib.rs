//! Types shared across the proxy core, the CLI, and the health/control surfaces.

use serde::{Deserialize, Serialize};

/// Broadcast on the process-wide shutdown watch channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownMessage {
    // only used at process start, before any shutdown has been requested.
    Init,
    Cancel(String),
}

/// A point-in-time liveness verdict shared between the session registry and the health HTTP
/// surface. The registry owns the write side; the HTTP handler only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HealthState {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl HealthState {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::healthy()
    }
}
