//! Session configuration.
//!
//! Every field has a default, so a YAML file only needs to name what differs:
//!
//! ```rust
//! use lightstage::{SessionConfig, ShotMode};
//!
//! let config = SessionConfig::from_yaml_str(
//!     "host: 192.168.1.20\nshot_mode: cross-polarized\ncapture:\n  global_exposure_steps: 1\n",
//! )
//! .unwrap();
//! assert_eq!(config.port, 50007);
//! assert_eq!(config.shot_mode, ShotMode::CrossPolarizedOnly);
//! assert_eq!(config.capture.exposure_time_ns(3), 1_200_000_000);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::DEFAULT_CAPACITY;
use crate::protocol::{AUXILIARY_PORT, SEQUENCER_PORT};
use crate::types::{ShotMode, WhiteBalance};
use crate::{CaptureError, Result};

/// Manual camera parameters used for still captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Sensor sensitivity (ISO)
    pub iso: u32,
    /// Exposure time at multiplier 1 and zero global steps
    pub base_exposure_ns: u64,
    /// Global exposure offset in stops, applied to every shot
    pub global_exposure_steps: u8,
    /// Manual focus distance in diopters
    pub focus_distance: f32,
    /// JPEG quality, 1..=100
    pub jpeg_quality: u8,
    pub white_balance: WhiteBalance,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            iso: 200,
            base_exposure_ns: 200_000_000,
            global_exposure_steps: 0,
            focus_distance: 4.75,
            jpeg_quality: 100,
            white_balance: WhiteBalance::CloudyDaylight,
        }
    }
}

impl CaptureSettings {
    /// Exposure time for a shot: base × multiplier × 2^steps, saturating.
    pub fn exposure_time_ns(&self, multiplier: u8) -> u64 {
        let stops = 1u64.checked_shl(u32::from(self.global_exposure_steps)).unwrap_or(u64::MAX);
        self.base_exposure_ns.saturating_mul(u64::from(multiplier)).saturating_mul(stops)
    }
}

/// Configuration for one sequencer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sequencer host name or address
    pub host: String,
    pub port: u16,
    /// Secondary peer port; `None` skips the secondary peer entirely
    pub aux_port: Option<u16>,
    pub shot_mode: ShotMode,
    /// Frames held in memory before a flush is forced
    pub buffer_capacity: usize,
    pub output_dir: PathBuf,
    pub device_open_timeout_ms: u64,
    pub shot_timeout_ms: u64,
    /// Skip focus/exposure convergence; focus is pinned externally
    pub burst_mode: bool,
    /// Also capture the raw sensor payload for every shot
    pub capture_auxiliary: bool,
    pub capture: CaptureSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: SEQUENCER_PORT,
            aux_port: Some(AUXILIARY_PORT),
            shot_mode: ShotMode::default(),
            buffer_capacity: DEFAULT_CAPACITY,
            output_dir: PathBuf::from("captures"),
            device_open_timeout_ms: 2_500,
            shot_timeout_ms: 10_000,
            burst_mode: false,
            capture_auxiliary: true,
            capture: CaptureSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| {
            CaptureError::config_with_source("Failed to parse session config", Box::new(e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading session config");
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            CaptureError::config_with_source(
                format!("Cannot read config file {}", path.display()),
                Box::new(e),
            )
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CaptureError::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(CaptureError::config("port must be non-zero"));
        }
        if self.aux_port == Some(0) {
            return Err(CaptureError::config("aux_port must be non-zero when set"));
        }
        if self.buffer_capacity == 0 {
            return Err(CaptureError::config("buffer_capacity must be at least 1"));
        }
        if self.device_open_timeout_ms == 0 || self.shot_timeout_ms == 0 {
            return Err(CaptureError::config("timeouts must be non-zero"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(CaptureError::config(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.capture.base_exposure_ns == 0 {
            return Err(CaptureError::config("base_exposure_ns must be non-zero"));
        }
        Ok(())
    }

    pub fn device_open_timeout(&self) -> Duration {
        Duration::from_millis(self.device_open_timeout_ms)
    }

    pub fn shot_timeout(&self) -> Duration {
        Duration::from_millis(self.shot_timeout_ms)
    }

    /// `host:port` of the sequencer.
    pub fn sequencer_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:aux_port` of the secondary peer, if configured.
    pub fn auxiliary_address(&self) -> Option<String> {
        self.aux_port.map(|port| format!("{}:{}", self.host, port))
    }
}
