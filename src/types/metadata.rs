//! Capture result metadata reported by the camera device

use serde::{Deserialize, Serialize};

/// Auto-focus state reported with a capture result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AfState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
    PassiveUnfocused,
}

impl AfState {
    /// Focus search has finished, whether or not it found focus.
    pub fn is_locked(self) -> bool {
        matches!(self, AfState::FocusedLocked | AfState::NotFocusedLocked)
    }
}

/// Auto-exposure state reported with a capture result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

/// White balance preset applied to preview and still requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteBalance {
    Auto,
    Daylight,
    #[default]
    CloudyDaylight,
    Incandescent,
    Fluorescent,
}

/// Partial or complete capture result.
///
/// Either state may be absent; some devices never report auto-exposure.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub af_state: Option<AfState>,
    pub ae_state: Option<AeState>,
    /// Near/far focus range in diopters, when reported
    pub focus_range: Option<(f32, f32)>,
}

impl ResultMetadata {
    pub fn new(af_state: Option<AfState>, ae_state: Option<AeState>) -> Self {
        Self { af_state, ae_state, focus_range: None }
    }

    /// Focus locked and exposure converged.
    pub fn converged() -> Self {
        Self::new(Some(AfState::FocusedLocked), Some(AeState::Converged))
    }

    pub fn with_focus_range(mut self, near: f32, far: f32) -> Self {
        self.focus_range = Some((near, far));
        self
    }
}

/// Camera parameters in effect for a still capture.
///
/// Paired with the auxiliary (raw sensor) payload so it can be encoded later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraMetadata {
    pub sensor_sensitivity: u32,
    pub exposure_time_ns: u64,
    pub focus_distance: f32,
    pub white_balance: WhiteBalance,
}
