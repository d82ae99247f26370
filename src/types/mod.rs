//! Core types for capture sequencing.
//!
//! This module provides the data structures shared by the capture state machine,
//! the frame buffer and the sequencer session.
//!
//! ## Overview
//!
//! - [`CaptureState`] is the single active state of the capture state machine
//! - [`ResultMetadata`] carries the auto-focus/auto-exposure states of a capture result
//! - [`FramePayload`] and [`Frame`] hold the captured bytes with zero-copy sharing via Arc
//! - [`ShotMode`] is the capture pattern negotiated during the handshake
//! - [`ExposureMultiplier`] is the one-shot exposure scalar set by the sequencer
//!
//! ## Usage Example
//!
//! ```rust
//! use lightstage::types::{ExposureMultiplier, ExposureRecord, FramePayload, ShotMode};
//!
//! let mut multiplier = ExposureMultiplier::default();
//! multiplier.set(3);
//! let exposure = ExposureRecord { multiplier: multiplier.take(), exposure_time_ns: 600_000_000 };
//! assert_eq!(multiplier.get(), 1);
//!
//! let payload = FramePayload::new(vec![0xFF, 0xD8, 0xFF], exposure);
//! assert_eq!(payload.len(), 3);
//! assert_eq!(ShotMode::from_code(12), Some(ShotMode::CrossPolarizedOnly));
//! ```

mod capture_state;
mod exposure;
mod frame;
mod metadata;
mod shot_mode;

pub use capture_state::CaptureState;
pub use exposure::{ExposureMultiplier, ExposureRecord};
pub use frame::{AuxiliaryPayload, Frame, FrameInfo, FramePayload};
pub use metadata::{AeState, AfState, CameraMetadata, ResultMetadata, WhiteBalance};
pub use shot_mode::ShotMode;
