//! Session configuration.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the registry does with the pose carried by a peer's first snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSightingPolicy {
    /// First sighting only creates the proxy; the pose is applied from the
    /// second sighting on. Newly joined peers appear one round late.
    #[default]
    Deferred,

    /// First sighting creates the proxy and applies the pose as its target.
    Immediate,
}

/// Configuration for a sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Session's logical name (for logging)
    pub name: String,

    /// Local pose publish period in ms (default: 50)
    pub publish_period_ms: u64,

    /// Render frame rate in Hz (default: 60)
    pub frame_rate_hz: u32,

    /// Share of the remaining distance covered per frame (default: 0.1)
    pub convergence_fraction: f64,

    /// Handling of a peer's first snapshot (default: Deferred)
    pub first_sighting: FirstSightingPolicy,

    /// Give the local peer's own batch entry a proxy too (default: false)
    pub mirror_local_peer: bool,

    /// EWMA weight for the per-peer mean latency (default: 0.2)
    pub latency_smoothing: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            name: "peersync-session".to_string(),
            publish_period_ms: 50,
            frame_rate_hz: 60,
            convergence_fraction: 0.1,
            first_sighting: FirstSightingPolicy::Deferred,
            mirror_local_peer: false,
            latency_smoothing: 0.2,
        }
    }
}

impl SyncConfig {
    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_period_ms)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate_hz.max(1) as f64)
    }

    /// Checks the values a session cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.publish_period_ms == 0 {
            return Err(SyncError::Config("publish_period_ms must be > 0".into()));
        }
        if self.frame_rate_hz == 0 {
            return Err(SyncError::Config("frame_rate_hz must be > 0".into()));
        }
        if !(self.convergence_fraction > 0.0 && self.convergence_fraction <= 1.0) {
            return Err(SyncError::Config(format!(
                "convergence_fraction must be in (0, 1], got {}",
                self.convergence_fraction
            )));
        }
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(SyncError::Config(format!(
                "latency_smoothing must be in (0, 1], got {}",
                self.latency_smoothing
            )));
        }
        Ok(())
    }

    /// Parses and validates a JSON config. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
