//! Camera capture sequencing.
//!
//! [`CaptureStateMachine`] decides what the camera should do next from each
//! capture result. [`CaptureDriver`] runs it on a dedicated task that owns the
//! device, appends delivered stills to the frame buffer and answers
//! [`CaptureHandle::take_picture`] with exactly one frame or one error.
//!
//! ```text
//!  take_picture ─► request_shot ─► LockFocus ─► on_result ─► TriggerPrecapture
//!                                                   │                │
//!                                                   ▼                ▼
//!                       append ◄─ StillCaptured ◄─ CaptureStill ◄─ on_result
//! ```

mod driver;
mod machine;

pub use driver::{CaptureDriver, CaptureHandle, DriverConfig, ShotReport};
pub use machine::{CaptureAction, CaptureMode, CaptureStateMachine};
