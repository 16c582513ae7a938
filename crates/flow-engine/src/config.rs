//! Engine and hardware configuration
//!
//! Both are plain JSON documents. Every engine setting has a default, so
//! an empty object is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hardware::{BoardConfig, DeviceConfig};

/// Run-time limits and timings for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Nested propagation passes allowed before the run is failed
    #[serde(default = "default_max_propagation_depth")]
    pub max_propagation_depth: usize,
    /// Upper bound for any single hardware call
    #[serde(default = "default_hardware_timeout_ms")]
    pub hardware_timeout_ms: u64,
    /// Poll interval used by wait nodes that do not set their own
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Write declared safe values when a run is stopped or fails
    #[serde(default = "default_true")]
    pub drive_safe_state_on_stop: bool,
    /// Default telemetry sampling interval
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
}

fn default_max_propagation_depth() -> usize {
    32
}

fn default_hardware_timeout_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_telemetry_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_propagation_depth: default_max_propagation_depth(),
            hardware_timeout_ms: default_hardware_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            drive_safe_state_on_stop: true,
            telemetry_interval_ms: default_telemetry_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn with_hardware_timeout(mut self, timeout: Duration) -> Self {
        self.hardware_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_propagation_depth(mut self, depth: usize) -> Self {
        self.max_propagation_depth = depth;
        self
    }

    /// Load from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref()).await
    }
}

/// Boards and devices available to a run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareConfig {
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Load from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref()).await
    }
}

async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    let value = serde_json::from_str(&content)?;
    log::debug!("Loaded configuration from {:?}", path);
    Ok(value)
}
