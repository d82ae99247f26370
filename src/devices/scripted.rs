//! Scripted camera device for dry runs and tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::device::{CaptureDevice, CaptureRequest, DeviceEvent, RequestKind};
use crate::types::ResultMetadata;
use crate::{CaptureError, Result};

/// In-process camera that replays scripted auto-focus/auto-exposure results.
///
/// Each lock-focus or precapture request consumes one batch of results from
/// the script; every result but the last is delivered as progress and the last
/// as the completed result. An exhausted script answers with a converged
/// result. Still requests deliver synthesized payloads.
pub struct ScriptedDevice {
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
    script: VecDeque<Vec<ResultMetadata>>,
    payload_size: usize,
    open_delay: Option<Duration>,
    fail_open: bool,
    shared: Arc<Mutex<Recorded>>,
}

#[derive(Debug, Default)]
struct Recorded {
    requests: Vec<CaptureRequest>,
    opened: bool,
    closed: bool,
    previewing: bool,
    fail_stills: u32,
    swallow_stills: u32,
    stills_delivered: u32,
}

/// Inspection and failure-injection handle for a [`ScriptedDevice`].
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    shared: Arc<Mutex<Recorded>>,
}

impl Default for ScriptedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self {
            events: None,
            script: VecDeque::new(),
            payload_size: 64,
            open_delay: None,
            fail_open: false,
            shared: Arc::default(),
        }
    }

    /// Append one batch of results, answered to the next convergence request.
    pub fn then(mut self, results: impl IntoIterator<Item = ResultMetadata>) -> Self {
        self.script.push_back(results.into_iter().collect());
        self
    }

    /// Size of the synthesized primary payload; the auxiliary one is 4× larger.
    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Delay before `open` succeeds.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Make `open` fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle { shared: Arc::clone(&self.shared) }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DeviceEvent) -> Result<()> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| CaptureError::device_failure("capture", "device is not open"))?;
        events.send(event).map_err(|_| CaptureError::device_failure("capture", "event receiver dropped"))
    }

    fn synthesize(&self, request: &CaptureRequest, sequence: u32) -> Vec<u8> {
        // JPEG start-of-image marker followed by a recognizable fill
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(&sequence.to_be_bytes());
        bytes.push(request.multiplier);
        bytes.resize(self.payload_size.max(bytes.len()), (sequence % 251) as u8);
        bytes
    }
}

impl ScriptHandle {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.recorded().requests.clone()
    }

    /// Still requests issued so far.
    pub fn stills(&self) -> Vec<CaptureRequest> {
        self.requests().into_iter().filter(|r| r.kind == RequestKind::Still).collect()
    }

    /// Report the next `count` still requests as failed.
    pub fn fail_next_stills(&self, count: u32) {
        self.recorded().fail_stills += count;
    }

    /// Accept the next `count` still requests without ever answering them.
    pub fn swallow_next_stills(&self, count: u32) {
        self.recorded().swallow_stills += count;
    }

    pub fn is_open(&self) -> bool {
        let recorded = self.recorded();
        recorded.opened && !recorded.closed
    }

    pub fn is_closed(&self) -> bool {
        self.recorded().closed
    }

    pub fn is_previewing(&self) -> bool {
        self.recorded().previewing
    }

    pub fn stills_delivered(&self) -> u32 {
        self.recorded().stills_delivered
    }
}

#[async_trait::async_trait]
impl CaptureDevice for ScriptedDevice {
    async fn open(&mut self, events: mpsc::UnboundedSender<DeviceEvent>) -> Result<()> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open {
            return Err(CaptureError::device_failure("open", "camera is in use"));
        }
        self.events = Some(events);
        self.recorded().opened = true;
        info!(batches = self.script.len(), "Scripted camera opened");
        Ok(())
    }

    async fn start_preview(&mut self, request: &CaptureRequest) -> Result<()> {
        let mut recorded = self.recorded();
        recorded.requests.push(request.clone());
        recorded.previewing = true;
        Ok(())
    }

    async fn issue_capture(&mut self, request: &CaptureRequest) -> Result<()> {
        trace!(kind = ?request.kind, multiplier = request.multiplier, "Scripted request");
        self.recorded().requests.push(request.clone());

        match request.kind {
            RequestKind::Still => {
                let (fail, swallow, sequence) = {
                    let mut recorded = self.recorded();
                    if recorded.fail_stills > 0 {
                        recorded.fail_stills -= 1;
                        (true, false, 0)
                    } else if recorded.swallow_stills > 0 {
                        recorded.swallow_stills -= 1;
                        (false, true, 0)
                    } else {
                        recorded.stills_delivered += 1;
                        (false, false, recorded.stills_delivered)
                    }
                };

                if fail {
                    debug!("Injecting still capture failure");
                    return self.emit(DeviceEvent::CaptureFailed {
                        shot: request.shot,
                        reason: "scripted capture failure".to_string(),
                    });
                }
                if swallow {
                    debug!("Swallowing still capture");
                    return Ok(());
                }

                let primary = self.synthesize(request, sequence);
                let auxiliary = request.include_auxiliary.then(|| {
                    let mut raw = self.synthesize(request, sequence);
                    raw.resize(self.payload_size.max(1) * 4, 0x5A);
                    raw
                });
                self.emit(DeviceEvent::Completed(ResultMetadata::converged()))?;
                self.emit(DeviceEvent::StillCaptured {
                    shot: request.shot,
                    primary,
                    auxiliary,
                    metadata: request.camera_metadata(),
                })
            }
            RequestKind::LockFocus | RequestKind::Precapture | RequestKind::Preview => {
                let batch =
                    self.script.pop_front().unwrap_or_else(|| vec![ResultMetadata::converged()]);
                let last = batch.len().saturating_sub(1);
                for (i, metadata) in batch.into_iter().enumerate() {
                    let event = if i == last {
                        DeviceEvent::Completed(metadata)
                    } else {
                        DeviceEvent::Progressed(metadata)
                    };
                    self.emit(event)?;
                }
                Ok(())
            }
        }
    }

    async fn stop_repeating(&mut self) -> Result<()> {
        self.recorded().previewing = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.events = None;
        let mut recorded = self.recorded();
        recorded.previewing = false;
        recorded.closed = true;
        info!(stills = recorded.stills_delivered, "Scripted camera closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted camera"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;
    use crate::types::{AeState, AfState};

    #[tokio::test]
    async fn replays_batches_then_converges() {
        let settings = CaptureSettings::default();
        let searching = ResultMetadata::new(Some(AfState::ActiveScan), Some(AeState::Searching));
        let mut device = ScriptedDevice::new().then([searching, ResultMetadata::converged()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.open(tx).await.unwrap();

        device.issue_capture(&CaptureRequest::lock_focus(&settings)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DeviceEvent::Progressed(m)) if m == searching));
        assert!(matches!(rx.recv().await, Some(DeviceEvent::Completed(_))));

        device.issue_capture(&CaptureRequest::precapture(&settings)).await.unwrap();
        assert!(
            matches!(rx.recv().await, Some(DeviceEvent::Completed(m)) if m == ResultMetadata::converged())
        );
    }

    #[tokio::test]
    async fn stills_carry_synthesized_payloads() {
        let settings = CaptureSettings::default();
        let mut device = ScriptedDevice::new().with_payload_size(16);
        let handle = device.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.open(tx).await.unwrap();

        device.issue_capture(&CaptureRequest::still(&settings, 2, true).for_shot(5)).await.unwrap();
        let _completed = rx.recv().await;
        match rx.recv().await {
            Some(DeviceEvent::StillCaptured { shot, primary, auxiliary, metadata }) => {
                assert_eq!(shot, 5);
                assert_eq!(primary.len(), 16);
                assert_eq!(&primary[..2], &[0xFF, 0xD8]);
                assert_eq!(auxiliary.map(|a| a.len()), Some(64));
                assert_eq!(metadata.exposure_time_ns, 400_000_000);
            }
            other => panic!("Expected StillCaptured, got {other:?}"),
        }
        assert_eq!(handle.stills().len(), 1);
        assert_eq!(handle.stills_delivered(), 1);
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let settings = CaptureSettings::default();
        let mut device = ScriptedDevice::new();
        let handle = device.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.open(tx).await.unwrap();
        assert!(handle.is_open());

        handle.fail_next_stills(1);
        device.issue_capture(&CaptureRequest::still(&settings, 1, false).for_shot(3)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DeviceEvent::CaptureFailed { shot: 3, .. })));
        assert_eq!(handle.stills_delivered(), 0);

        device.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(device.issue_capture(&CaptureRequest::lock_focus(&settings)).await.is_err());
    }

    #[tokio::test]
    async fn failing_open_reports_device_error() {
        let mut device = ScriptedDevice::new().failing_open();
        let (tx, _rx) = mpsc::unbounded_channel();
        let error = device.open(tx).await.unwrap_err();
        assert!(matches!(error, CaptureError::Device { .. }));
    }
}
