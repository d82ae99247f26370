//! Per-shot exposure control

use serde::{Deserialize, Serialize};

/// Scalar applied to the exposure time of exactly one shot.
///
/// Set by the sequencer's ADJUST_EXPOSURE command and consumed by the next
/// shot, after which it falls back to 1 whether the shot succeeded or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureMultiplier(u8);

impl Default for ExposureMultiplier {
    fn default() -> Self {
        Self(1)
    }
}

impl ExposureMultiplier {
    /// Create a multiplier; zero is treated as 1.
    pub fn new(value: u8) -> Self {
        Self(value.max(1))
    }

    /// Interpret an operand byte from the wire as an unsigned multiplier.
    pub fn from_wire(byte: i8) -> Self {
        Self::new(byte as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn set(&mut self, value: u8) {
        *self = Self::new(value);
    }

    /// Consume the current value, resetting to 1.
    pub fn take(&mut self) -> u8 {
        std::mem::take(self).0
    }
}

/// Exposure actually requested for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub multiplier: u8,
    pub exposure_time_ns: u64,
}
