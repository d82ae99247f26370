//! Capture driver task owning the camera device

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::machine::{CaptureAction, CaptureMode, CaptureStateMachine};
use crate::buffer::{FlushRange, SharedFrameBuffer};
use crate::config::CaptureSettings;
use crate::device::{CaptureDevice, CaptureRequest, DeviceEvent};
use crate::persistence::PersistenceHandle;
use crate::types::{CameraMetadata, CaptureState, ExposureRecord, FrameInfo, FramePayload};
use crate::{CaptureError, Result};

/// Driver parameters
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub mode: CaptureMode,
    pub settings: CaptureSettings,
    pub open_timeout: Duration,
    pub shot_timeout: Duration,
}

/// Successful shot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotReport {
    pub frame: FrameInfo,
    /// Range handed to persistence because this frame overflowed the buffer
    pub flushed: Option<FlushRange>,
}

enum DriverCommand {
    Shot { multiplier: u8, reply: oneshot::Sender<Result<ShotReport>> },
    ResetToPreview { reply: oneshot::Sender<()> },
}

/// Handle to a running capture driver.
pub struct CaptureHandle {
    commands: mpsc::Sender<DriverCommand>,
    state: watch::Receiver<CaptureState>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl CaptureHandle {
    /// Take one picture with the given exposure multiplier.
    ///
    /// Resolves once the frame is buffered or the shot has failed.
    pub async fn take_picture(&self, multiplier: u8) -> Result<ShotReport> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(DriverCommand::Shot { multiplier, reply })
            .await
            .map_err(|_| CaptureError::Shutdown { component: "capture driver" })?;
        outcome.await.map_err(|_| CaptureError::Shutdown { component: "capture driver" })?
    }

    /// Abandon any shot in progress and restart the preview.
    pub async fn reset_to_preview(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(DriverCommand::ResetToPreview { reply })
            .await
            .map_err(|_| CaptureError::Shutdown { component: "capture driver" })?;
        done.await.map_err(|_| CaptureError::Shutdown { component: "capture driver" })
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    /// Stream of capture state changes, starting with the current state.
    pub fn state_changes(&self) -> WatchStream<CaptureState> {
        WatchStream::new(self.state.clone())
    }

    /// Stop the driver and close the device.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!("Capture driver task failed: {}", e);
        }
    }
}

/// Spawns the task that owns the device and runs the state machine
pub struct CaptureDriver;

impl CaptureDriver {
    /// Open the device within the configured timeout, start the preview and
    /// spawn the driver task.
    pub async fn spawn<D>(
        mut device: D,
        config: DriverConfig,
        buffer: SharedFrameBuffer,
        persistence: PersistenceHandle,
    ) -> Result<CaptureHandle>
    where
        D: CaptureDevice,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(device = device.name(), timeout = ?config.open_timeout, "Opening camera");
        tokio::time::timeout(config.open_timeout, device.open(event_tx))
            .await
            .map_err(|_| CaptureError::timeout("camera open", config.open_timeout))??;

        let preview = CaptureRequest::preview(&config.settings);
        if let Err(e) = device.start_preview(&preview).await {
            let _ = device.close().await;
            return Err(e);
        }

        let (command_tx, command_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(CaptureState::Preview);
        let cancel = CancellationToken::new();

        let task = DriverTask {
            machine: CaptureStateMachine::new(config.mode),
            device,
            config,
            buffer,
            persistence,
            state_tx,
            pending: None,
            last_shot: 0,
        };
        let join = tokio::spawn(task.run(command_rx, event_rx, cancel.clone()));

        Ok(CaptureHandle { commands: command_tx, state: state_rx, cancel, join })
    }
}

struct PendingShot {
    id: u32,
    exposure: ExposureRecord,
    deadline: Instant,
    reply: oneshot::Sender<Result<ShotReport>>,
}

struct DriverTask<D> {
    device: D,
    machine: CaptureStateMachine,
    config: DriverConfig,
    buffer: SharedFrameBuffer,
    persistence: PersistenceHandle,
    state_tx: watch::Sender<CaptureState>,
    pending: Option<PendingShot>,
    /// Tag of the most recent shot; tags start at 1
    last_shot: u32,
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<D: CaptureDevice> DriverTask<D> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<DriverCommand>,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: CancellationToken,
    ) {
        info!("Capture driver started");

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Capture driver cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(DriverCommand::Shot { multiplier, reply }) => {
                        self.begin_shot(multiplier, reply).await;
                    }
                    Some(DriverCommand::ResetToPreview { reply }) => {
                        self.fail_pending(CaptureError::device_failure(
                            "capture",
                            "shot abandoned by reset",
                        ))
                        .await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Some(DeviceEvent::Disconnected) | None => {
                        warn!("Camera disconnected");
                        self.fail_pending(CaptureError::device_failure("capture", "camera disconnected"))
                            .await;
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                },
                _ = wait_for(deadline) => {
                    let timeout = self.config.shot_timeout;
                    warn!(?timeout, state = %self.machine.state(), "Shot timed out");
                    self.fail_pending(CaptureError::timeout("still capture", timeout)).await;
                }
            }
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(CaptureError::Shutdown { component: "capture driver" }));
        }
        if let Err(e) = self.device.close().await {
            warn!("Failed to close camera: {}", e);
        }
        info!("Capture driver ended ({} shots requested)", self.last_shot);
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn begin_shot(&mut self, multiplier: u8, reply: oneshot::Sender<Result<ShotReport>>) {
        if self.pending.is_some() {
            let state = self.machine.state();
            let _ = reply.send(Err(CaptureError::InvalidState { operation: "request a shot", state }));
            return;
        }

        let action = match self.machine.request_shot() {
            Ok(action) => action,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let exposure = ExposureRecord {
            multiplier,
            exposure_time_ns: self.config.settings.exposure_time_ns(multiplier),
        };
        self.last_shot += 1;
        let id = self.last_shot;
        debug!(shot = id, multiplier, exposure_ns = exposure.exposure_time_ns, "Shot requested");
        self.pending = Some(PendingShot {
            id,
            exposure,
            deadline: Instant::now() + self.config.shot_timeout,
            reply,
        });
        self.publish();
        self.advance(action).await;
    }

    /// Issue the device request for `action`; failures of convergence or
    /// capture requests fail the pending shot.
    async fn advance(&mut self, action: CaptureAction) {
        if let Err(e) = self.perform(action).await {
            error!(?action, "Camera request failed: {}", e);
            self.fail_pending(e).await;
        }
    }

    async fn perform(&mut self, action: CaptureAction) -> Result<()> {
        let settings = &self.config.settings;
        match action {
            CaptureAction::LockFocus => {
                self.device.issue_capture(&CaptureRequest::lock_focus(settings)).await
            }
            CaptureAction::TriggerPrecapture => {
                self.device.issue_capture(&CaptureRequest::precapture(settings)).await
            }
            CaptureAction::CaptureStill { auxiliary } => {
                let (shot, multiplier) =
                    self.pending.as_ref().map_or((0, 1), |p| (p.id, p.exposure.multiplier));
                let request = CaptureRequest::still(settings, multiplier, auxiliary).for_shot(shot);
                self.device.stop_repeating().await?;
                self.device.issue_capture(&request).await
            }
            CaptureAction::ResumePreview => {
                self.device.start_preview(&CaptureRequest::preview(settings)).await
            }
        }
    }

    async fn resume_preview(&mut self, action: CaptureAction) {
        if let Err(e) = self.perform(action).await {
            warn!("Failed to resume preview: {}", e);
        }
    }

    async fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Progressed(metadata) | DeviceEvent::Completed(metadata) => {
                let action = self.machine.on_result(&metadata);
                self.publish();
                if let Some(action) = action {
                    self.advance(action).await;
                }
            }
            DeviceEvent::StillCaptured { shot, primary, auxiliary, metadata } => {
                if self.awaits_still(shot) {
                    self.complete_shot(primary, auxiliary, metadata).await;
                } else {
                    warn!(shot, state = %self.machine.state(), "Discarding still image of another shot");
                }
            }
            DeviceEvent::CaptureFailed { shot, reason } => {
                // Untagged failures belong to the focus/exposure requests of the current shot
                let current = if shot == 0 {
                    self.pending.is_some() && self.machine.state().is_converging()
                } else {
                    self.awaits_still(shot)
                };
                if current {
                    self.fail_pending(CaptureError::device_failure("capture", reason)).await;
                } else {
                    warn!(shot, "Ignoring failure of another shot: {}", reason);
                }
            }
            DeviceEvent::Disconnected => {}
        }
    }

    /// Whether the still request tagged `shot` is the one the pending shot waits on.
    fn awaits_still(&self, shot: u32) -> bool {
        self.machine.state() == CaptureState::PictureTaken
            && self.pending.as_ref().is_some_and(|pending| pending.id == shot)
    }

    async fn complete_shot(
        &mut self,
        primary: Vec<u8>,
        auxiliary: Option<Vec<u8>>,
        metadata: CameraMetadata,
    ) {
        let Some(pending) = self.pending.take() else {
            warn!("Discarding still image delivered without a pending shot");
            return;
        };

        let mut payload = FramePayload::new(primary, pending.exposure);
        if let Some(raw) = auxiliary.filter(|_| self.machine.mode().auxiliary) {
            payload = payload.with_auxiliary(raw, Arc::new(metadata));
        }
        let primary_len = payload.primary.len();
        let auxiliary_len = payload.auxiliary.as_ref().map(|aux| aux.data.len());

        let outcome = self.buffer.append(payload);
        if let Some(range) = outcome.flush {
            if let Err(e) = self.persistence.schedule(range) {
                error!("Failed to schedule flush: {}", e);
            }
        }

        let action = self.machine.on_shot_complete();
        self.publish();
        self.resume_preview(action).await;

        debug!(index = outcome.index, bytes = primary_len, "Frame captured");
        let report = ShotReport {
            frame: FrameInfo {
                index: outcome.index,
                primary_len,
                auxiliary_len,
                exposure: pending.exposure,
            },
            flushed: outcome.flush,
        };
        let _ = pending.reply.send(Ok(report));
    }

    /// Fail the pending shot, if any, and return to preview.
    async fn fail_pending(&mut self, error: CaptureError) {
        let action = self.machine.abort();
        self.publish();
        self.resume_preview(action).await;

        if let Some(pending) = self.pending.take() {
            warn!("Shot failed: {}", error);
            let _ = pending.reply.send(Err(error));
        }
    }
}
