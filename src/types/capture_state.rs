//! Camera capture state

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the capture state machine for one camera session.
///
/// `PictureTaken` and `BurstSequence` are per-shot terminal states that re-arm
/// once the still image has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CaptureState {
    /// Repeating preview is running, ready for a shot
    #[default]
    Preview,
    /// Waiting for the focus to be locked
    WaitingLock,
    /// Waiting for auto-exposure to enter precapture
    WaitingPrecapture,
    /// Waiting for auto-exposure to leave precapture
    WaitingNonPrecapture,
    /// Final still capture has been issued
    PictureTaken,
    /// Burst mode armed, focus pinned externally
    BurstSequence,
}

impl CaptureState {
    /// Whether a new shot may be requested from this state.
    pub fn accepts_shot(self) -> bool {
        matches!(self, CaptureState::Preview | CaptureState::BurstSequence)
    }

    /// Whether the machine is waiting on focus or exposure convergence.
    pub fn is_converging(self) -> bool {
        matches!(
            self,
            CaptureState::WaitingLock
                | CaptureState::WaitingPrecapture
                | CaptureState::WaitingNonPrecapture
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Preview => "PREVIEW",
            CaptureState::WaitingLock => "WAITING_LOCK",
            CaptureState::WaitingPrecapture => "WAITING_PRECAPTURE",
            CaptureState::WaitingNonPrecapture => "WAITING_NON_PRECAPTURE",
            CaptureState::PictureTaken => "PICTURE_TAKEN",
            CaptureState::BurstSequence => "BURST_SEQUENCE",
        };
        f.write_str(name)
    }
}
