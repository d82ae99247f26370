//! Focus/exposure convergence state machine.
//!
//! The machine is pure: it maps `(state, result metadata)` to the next state
//! and the device action to perform. The driver owns the device and executes
//! the actions.

use tracing::{debug, trace};

use crate::types::{AeState, CaptureState, ResultMetadata};
use crate::{CaptureError, Result};

/// Capture mode fixed for the lifetime of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureMode {
    /// Skip convergence; focus is pinned externally
    pub burst: bool,
    /// Request the raw sensor payload with each still
    pub auxiliary: bool,
}

/// Device action requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureAction {
    LockFocus,
    TriggerPrecapture,
    CaptureStill { auxiliary: bool },
    ResumePreview,
}

#[derive(Debug, Clone)]
pub struct CaptureStateMachine {
    state: CaptureState,
    mode: CaptureMode,
}

impl CaptureStateMachine {
    pub fn new(mode: CaptureMode) -> Self {
        Self { state: CaptureState::Preview, mode }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    fn capture_still(&mut self) -> CaptureAction {
        self.state = CaptureState::PictureTaken;
        CaptureAction::CaptureStill { auxiliary: self.mode.auxiliary }
    }

    /// Begin a shot. Valid only from `Preview` or `BurstSequence`.
    pub fn request_shot(&mut self) -> Result<CaptureAction> {
        if !self.state.accepts_shot() {
            return Err(CaptureError::InvalidState { operation: "request a shot", state: self.state });
        }

        if self.mode.burst {
            Ok(self.capture_still())
        } else {
            self.state = CaptureState::WaitingLock;
            Ok(CaptureAction::LockFocus)
        }
    }

    /// Advance on a partial or complete capture result.
    pub fn on_result(&mut self, metadata: &ResultMetadata) -> Option<CaptureAction> {
        trace!(state = %self.state, af = ?metadata.af_state, ae = ?metadata.ae_state, "Capture result");

        match self.state {
            CaptureState::WaitingLock => match metadata.af_state {
                None => Some(self.capture_still()),
                Some(af) if af.is_locked() => match metadata.ae_state {
                    None | Some(AeState::Converged) => Some(self.capture_still()),
                    Some(_) => {
                        self.state = CaptureState::WaitingPrecapture;
                        Some(CaptureAction::TriggerPrecapture)
                    }
                },
                Some(_) => None,
            },
            CaptureState::WaitingPrecapture => match metadata.ae_state {
                None | Some(AeState::Precapture) | Some(AeState::FlashRequired) => {
                    self.state = CaptureState::WaitingNonPrecapture;
                    None
                }
                Some(_) => None,
            },
            CaptureState::WaitingNonPrecapture => match metadata.ae_state {
                Some(AeState::Precapture) => None,
                _ => {
                    debug!(focus_range = ?metadata.focus_range, "Exposure settled");
                    Some(self.capture_still())
                }
            },
            CaptureState::Preview | CaptureState::PictureTaken | CaptureState::BurstSequence => None,
        }
    }

    /// The still image was delivered; re-arm for the next shot.
    pub fn on_shot_complete(&mut self) -> CaptureAction {
        self.state =
            if self.mode.burst { CaptureState::BurstSequence } else { CaptureState::Preview };
        CaptureAction::ResumePreview
    }

    /// Abandon the current shot. Always lands in `Preview`.
    pub fn abort(&mut self) -> CaptureAction {
        self.state = CaptureState::Preview;
        CaptureAction::ResumePreview
    }
}
