//! Shot mode negotiated at session start

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capture pattern selected once per session.
///
/// The wire value is sent as the handshake byte and must be echoed back
/// unchanged by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShotMode {
    #[default]
    #[serde(alias = "single shot")]
    SingleShot,
    #[serde(alias = "no polarizer")]
    NoPolarizer,
    #[serde(alias = "cross-polarized")]
    CrossPolarizedOnly,
    #[serde(alias = "full-blown shoot")]
    FullBlown,
    #[serde(alias = "do nothing - just shoot")]
    DoNothing,
    #[serde(alias = "single LED - substance style")]
    SingleLedTurnaround,
}

impl ShotMode {
    /// All shot modes in wire order.
    pub const ALL: [ShotMode; 6] = [
        ShotMode::SingleShot,
        ShotMode::NoPolarizer,
        ShotMode::CrossPolarizedOnly,
        ShotMode::FullBlown,
        ShotMode::DoNothing,
        ShotMode::SingleLedTurnaround,
    ];

    /// Handshake byte for this mode.
    pub const fn code(self) -> i8 {
        match self {
            ShotMode::SingleShot => 10,
            ShotMode::NoPolarizer => 11,
            ShotMode::CrossPolarizedOnly => 12,
            ShotMode::FullBlown => 13,
            ShotMode::DoNothing => 14,
            ShotMode::SingleLedTurnaround => 15,
        }
    }

    /// Parse a handshake byte.
    pub fn from_code(code: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.code() == code)
    }

    /// Human-readable label shown to the operator.
    pub const fn description(self) -> &'static str {
        match self {
            ShotMode::SingleShot => "single shot",
            ShotMode::NoPolarizer => "without polarizer only",
            ShotMode::CrossPolarizedOnly => "cross-polarized only",
            ShotMode::FullBlown => "full-blown shoot",
            ShotMode::DoNothing => "do nothing - just tell the camera to shoot",
            ShotMode::SingleLedTurnaround => "single LED - substance style",
        }
    }
}

impl fmt::Display for ShotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}
