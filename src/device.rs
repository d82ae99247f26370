//! Camera device trait

use tokio::sync::mpsc;

use crate::Result;
use crate::config::CaptureSettings;
use crate::types::{CameraMetadata, ResultMetadata, WhiteBalance};

/// Purpose of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Repeating preview with auto-focus off
    Preview,
    /// One-off auto-focus trigger
    LockFocus,
    /// One-off auto-exposure precapture trigger
    Precapture,
    /// Final manual-exposure still capture
    Still,
}

/// Parameters of one capture request.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub kind: RequestKind,
    /// Manual exposure time; `None` leaves auto-exposure in charge
    pub exposure_time_ns: Option<u64>,
    pub sensitivity: Option<u32>,
    pub focus_distance: f32,
    pub white_balance: WhiteBalance,
    pub jpeg_quality: u8,
    /// Exposure multiplier this request was built for
    pub multiplier: u8,
    /// Deliver the raw sensor payload alongside the encoded image
    pub include_auxiliary: bool,
    /// Shot a still belongs to; 0 for preview and convergence requests
    pub shot: u32,
}

impl CaptureRequest {
    fn base(kind: RequestKind, settings: &CaptureSettings) -> Self {
        Self {
            kind,
            exposure_time_ns: None,
            sensitivity: None,
            focus_distance: settings.focus_distance,
            white_balance: settings.white_balance,
            jpeg_quality: settings.jpeg_quality,
            multiplier: 1,
            include_auxiliary: false,
            shot: 0,
        }
    }

    pub fn preview(settings: &CaptureSettings) -> Self {
        Self::base(RequestKind::Preview, settings)
    }

    pub fn lock_focus(settings: &CaptureSettings) -> Self {
        Self::base(RequestKind::LockFocus, settings)
    }

    pub fn precapture(settings: &CaptureSettings) -> Self {
        Self::base(RequestKind::Precapture, settings)
    }

    /// Manual-exposure still for the given multiplier.
    pub fn still(settings: &CaptureSettings, multiplier: u8, include_auxiliary: bool) -> Self {
        Self {
            exposure_time_ns: Some(settings.exposure_time_ns(multiplier)),
            sensitivity: Some(settings.iso),
            multiplier,
            include_auxiliary,
            ..Self::base(RequestKind::Still, settings)
        }
    }

    /// Tag the request with the shot it serves. Devices echo the tag on the
    /// events the request produces.
    pub fn for_shot(mut self, shot: u32) -> Self {
        self.shot = shot;
        self
    }

    /// Metadata snapshot describing the parameters of a still request.
    pub fn camera_metadata(&self) -> CameraMetadata {
        CameraMetadata {
            sensor_sensitivity: self.sensitivity.unwrap_or_default(),
            exposure_time_ns: self.exposure_time_ns.unwrap_or_default(),
            focus_distance: self.focus_distance,
            white_balance: self.white_balance,
        }
    }
}

/// Asynchronous notifications from a camera device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Partial result of an in-flight request
    Progressed(ResultMetadata),
    /// Final result of a request
    Completed(ResultMetadata),
    /// Still image bytes are available for the request tagged `shot`
    StillCaptured {
        shot: u32,
        primary: Vec<u8>,
        auxiliary: Option<Vec<u8>>,
        metadata: CameraMetadata,
    },
    /// The device could not complete the request tagged `shot`
    CaptureFailed { shot: u32, reason: String },
    Disconnected,
}

/// Trait for camera devices
///
/// Requests are fire-and-forget; their outcomes arrive as [`DeviceEvent`]s on
/// the channel handed to [`CaptureDevice::open`]. Methods return an error only
/// when the request could not be issued at all.
#[async_trait::async_trait]
pub trait CaptureDevice: Send + 'static {
    /// Acquire the device and remember where to deliver events.
    async fn open(&mut self, events: mpsc::UnboundedSender<DeviceEvent>) -> Result<()>;

    /// Start (or restart) the repeating preview request.
    async fn start_preview(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Issue a single non-repeating request.
    async fn issue_capture(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Stop the repeating preview.
    async fn stop_repeating(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "camera"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_request_uses_manual_exposure() {
        let settings = CaptureSettings { global_exposure_steps: 1, ..Default::default() };
        let request = CaptureRequest::still(&settings, 3, true);
        assert_eq!(request.kind, RequestKind::Still);
        assert_eq!(request.exposure_time_ns, Some(1_200_000_000));
        assert_eq!(request.sensitivity, Some(200));
        assert_eq!(request.jpeg_quality, 100);
        assert!(request.include_auxiliary);
        assert_eq!(request.shot, 0);
        assert_eq!(request.clone().for_shot(7).shot, 7);

        let metadata = request.camera_metadata();
        assert_eq!(metadata.exposure_time_ns, 1_200_000_000);
        assert_eq!(metadata.focus_distance, 4.75);
    }

    #[test]
    fn preview_leaves_exposure_automatic() {
        let request = CaptureRequest::preview(&CaptureSettings::default());
        assert_eq!(request.exposure_time_ns, None);
        assert_eq!(request.white_balance, WhiteBalance::CloudyDaylight);
        assert!(!request.include_auxiliary);
    }
}
