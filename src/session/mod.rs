//! Sequencer session.
//!
//! A session owns the socket to the sequencer, negotiates the shot mode,
//! optionally brings the secondary peer along, and then serves one command
//! byte at a time until the sequencer asks for a clean exit:
//!
//! ```text
//! Connecting ─► Handshaking ─► AwaitingAuxPeer ─► Running ─► Closing ─► Closed
//!      │             │                               │
//!      └─────────────┴──────── fatal error ──────────┴──────► Closing ─► Closed
//! ```
//!
//! Shots are delegated to the capture driver and awaited; frames go to the
//! shared buffer and are written by the persistence worker in the background.
//! Progress and failures are published as [`SessionEvent`]s.

mod peer;
#[cfg(test)]
mod tests;

use std::fmt;
use std::net::SocketAddr;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, error, info, warn};

use self::peer::AuxiliaryPeer;
use crate::buffer::{SessionCursor, SharedFrameBuffer};
use crate::capture::{CaptureDriver, CaptureHandle, CaptureMode, DriverConfig};
use crate::config::SessionConfig;
use crate::device::CaptureDevice;
use crate::persistence::{
    FrameNaming, FrameStore, PersistenceChannels, PersistenceFailure, PersistenceHandle,
    PersistenceStats, PersistenceWorker,
};
use crate::protocol::{AuxReply, Command, Peer, PeerLink, Reply};
use crate::types::{ExposureMultiplier, FrameInfo, ShotMode};
use crate::{CaptureError, Result};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a sequencer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AwaitingAuxPeer,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::AwaitingAuxPeer => "awaiting secondary peer",
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Whether an error ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    Fatal,
}

/// Notification published by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A frame was captured and buffered
    FrameReady(FrameInfo),
    /// A failure; `code` is the byte reported to the sequencer, if any
    Error { code: Option<i8>, message: String, severity: Severity },
    /// Status reply from the secondary peer while it shuts down
    AuxStatus(AuxReply),
    StateChanged(SessionState),
}

/// Counters for a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub shot_mode: ShotMode,
    pub frames_captured: u32,
    pub failed_shots: u32,
    pub frames_written: u32,
    pub failed_writes: u32,
}

enum Incoming {
    Byte(i8),
    SaveFailed(PersistenceFailure),
}

/// Session with the sequencer over a byte stream.
pub struct SequencerSession<S> {
    config: SessionConfig,
    primary: Option<PeerLink<S>>,
    aux_stream: Option<S>,
    aux: Option<AuxiliaryPeer<S>>,
    capture: Option<CaptureHandle>,
    persistence: PersistenceHandle,
    persistence_join: Option<JoinHandle<PersistenceStats>>,
    failures: mpsc::UnboundedReceiver<PersistenceFailure>,
    buffer: SharedFrameBuffer,
    multiplier: ExposureMultiplier,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    summary: SessionSummary,
}

impl SequencerSession<TcpStream> {
    /// Resolve and connect to the sequencer, then try the secondary peer.
    ///
    /// An unknown host or a refused sequencer connection is fatal. A missing
    /// secondary peer is not.
    pub async fn connect<D, F>(config: SessionConfig, device: D, store: F) -> Result<Self>
    where
        D: CaptureDevice,
        F: FrameStore,
    {
        config.validate()?;

        let host = config.host.clone();
        let address = tokio::net::lookup_host((host.as_str(), config.port))
            .await
            .map_err(|e| CaptureError::UnknownHost { host: host.clone(), source: Some(e) })?
            .next()
            .ok_or_else(|| CaptureError::UnknownHost { host: host.clone(), source: None })?;

        info!(%address, "Connecting to sequencer");
        let primary = TcpStream::connect(address)
            .await
            .map_err(|e| CaptureError::connection_failed(address.to_string(), e))?;
        if let Err(e) = primary.set_nodelay(true) {
            debug!("Failed to disable Nagle on sequencer socket: {}", e);
        }

        let aux = match config.aux_port {
            Some(port) => connect_auxiliary(SocketAddr::new(address.ip(), port)).await,
            None => None,
        };

        Self::with_streams(config, device, store, primary, aux).await
    }
}

async fn connect_auxiliary(address: SocketAddr) -> Option<TcpStream> {
    match TcpStream::connect(address).await {
        Ok(stream) => {
            info!(%address, "Connected to secondary peer");
            Some(stream)
        }
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            info!(%address, "No secondary peer listening");
            None
        }
        Err(e) => {
            warn!(%address, "Secondary peer unreachable: {}", e);
            None
        }
    }
}

impl<S> SequencerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Build a session over already-connected streams.
    ///
    /// Opens the camera (bounded by the configured timeout) and starts the
    /// persistence worker. Nothing is sent until [`run`](Self::run).
    pub async fn with_streams<D, F>(
        config: SessionConfig,
        device: D,
        store: F,
        primary: S,
        aux: Option<S>,
    ) -> Result<Self>
    where
        D: CaptureDevice,
        F: FrameStore,
    {
        config.validate()?;

        let buffer = SharedFrameBuffer::new(config.buffer_capacity);
        let PersistenceChannels { handle: persistence, failures, join } =
            PersistenceWorker::spawn(store, buffer.clone(), FrameNaming::default());

        let driver_config = DriverConfig {
            mode: CaptureMode { burst: config.burst_mode, auxiliary: config.capture_auxiliary },
            settings: config.capture.clone(),
            open_timeout: config.device_open_timeout(),
            shot_timeout: config.shot_timeout(),
        };
        let capture =
            match CaptureDriver::spawn(device, driver_config, buffer.clone(), persistence.clone())
                .await
            {
                Ok(capture) => capture,
                Err(e) => {
                    persistence.shutdown();
                    return Err(e);
                }
            };

        let (state, _) = watch::channel(SessionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let summary = SessionSummary { shot_mode: config.shot_mode, ..Default::default() };

        Ok(Self {
            config,
            primary: Some(PeerLink::new(primary, Peer::Sequencer)),
            aux_stream: aux,
            aux: None,
            capture: Some(capture),
            persistence,
            persistence_join: Some(join),
            failures,
            buffer,
            multiplier: ExposureMultiplier::default(),
            state,
            events,
            summary,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Stream of session states, starting with the current one.
    pub fn state_changes(&self) -> WatchStream<SessionState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Stream of session events from now on.
    ///
    /// A subscriber that falls more than 256 events behind skips the oldest.
    pub fn subscribe(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    pub fn cursor(&self) -> SessionCursor {
        self.buffer.cursor()
    }

    /// Handshake, serve commands until a clean exit, then close.
    ///
    /// A fatal error closes the session after a best-effort flush of buffered
    /// frames and is returned.
    pub async fn run(&mut self) -> Result<SessionSummary> {
        if self.state() != SessionState::Connecting {
            return Err(CaptureError::Shutdown { component: "sequencer session" });
        }

        let outcome = self.drive().await;
        if let Err(error) = &outcome {
            error!(state = %self.state(), "Session failed: {}", error);
            self.emit_error(error, Severity::Fatal);
            if self.state() == SessionState::Running {
                for failure in self.flush_best_effort().await {
                    self.note_save_failure(&failure);
                }
            }
        }

        self.close().await;
        outcome.map(|()| self.summary)
    }

    /// Release both sockets, return the camera to preview and stop the
    /// background tasks. Idempotent.
    pub async fn close(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closing);

        if let Some(mut aux) = self.aux.take() {
            if let Err(e) = aux.close().await {
                debug!("Secondary peer close: {}", e);
            }
        }
        self.aux_stream = None;
        if let Some(mut primary) = self.primary.take() {
            if let Err(e) = primary.shutdown().await {
                debug!("Sequencer close: {}", e);
            }
        }

        if let Some(capture) = self.capture.take() {
            if let Err(e) = capture.reset_to_preview().await {
                warn!("Failed to return camera to preview: {}", e);
            }
            capture.shutdown().await;
        }

        self.persistence.shutdown();
        if let Some(join) = self.persistence_join.take() {
            match join.await {
                Ok(stats) => {
                    self.summary.frames_written = stats.frames_written;
                    self.summary.failed_writes = stats.failed_writes;
                }
                Err(e) => error!("Persistence worker failed: {}", e),
            }
        }
        while let Ok(failure) = self.failures.try_recv() {
            self.note_save_failure(&failure);
        }

        self.set_state(SessionState::Closed);
        info!(
            captured = self.summary.frames_captured,
            written = self.summary.frames_written,
            failed_shots = self.summary.failed_shots,
            failed_writes = self.summary.failed_writes,
            "Session closed"
        );
    }

    async fn drive(&mut self) -> Result<()> {
        self.handshake().await?;
        self.attach_auxiliary().await;
        self.set_state(SessionState::Running);
        self.command_loop().await
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state.send_replace(state) != state {
            debug!(%state, "Session state changed");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &CaptureError, severity: Severity) {
        self.emit(SessionEvent::Error {
            code: error.wire_code(),
            message: error.to_string(),
            severity,
        });
    }

    fn primary_link(&mut self) -> Result<&mut PeerLink<S>> {
        self.primary.as_mut().ok_or(CaptureError::Shutdown { component: "sequencer link" })
    }

    fn capture(&self) -> Result<&CaptureHandle> {
        self.capture.as_ref().ok_or(CaptureError::Shutdown { component: "capture driver" })
    }

    async fn handshake(&mut self) -> Result<()> {
        self.set_state(SessionState::Handshaking);
        let mode = self.config.shot_mode;
        let sent = mode.code();

        let primary = self.primary_link()?;
        primary.send(sent).await?;
        let received = primary.recv().await?;
        if received != sent {
            return Err(CaptureError::Handshake { sent, received });
        }

        info!(%mode, "Handshake complete");
        Ok(())
    }

    async fn attach_auxiliary(&mut self) {
        self.set_state(SessionState::AwaitingAuxPeer);
        let Some(stream) = self.aux_stream.take() else {
            debug!("Running without secondary peer");
            return;
        };

        match AuxiliaryPeer::init(stream).await {
            Ok(aux) => self.aux = Some(aux),
            Err(e) => {
                warn!("Continuing without secondary peer: {}", e);
                self.emit_error(&e, Severity::Transient);
            }
        }
    }

    fn detach_auxiliary(&mut self, error: CaptureError) {
        warn!("Lost secondary peer: {}", error);
        self.aux = None;
        self.emit_error(&error, Severity::Transient);
    }

    async fn command_loop(&mut self) -> Result<()> {
        loop {
            self.relieve_backpressure()?;

            let incoming = {
                let primary =
                    self.primary.as_mut().ok_or(CaptureError::Shutdown { component: "sequencer link" })?;
                tokio::select! {
                    biased;
                    Some(failure) = self.failures.recv() => Incoming::SaveFailed(failure),
                    byte = primary.recv() => Incoming::Byte(byte?),
                }
            };

            let byte = match incoming {
                Incoming::SaveFailed(failure) => {
                    self.report_save_failure(&failure).await?;
                    continue;
                }
                Incoming::Byte(byte) => byte,
            };

            match Command::from_code(byte) {
                Some(Command::StartCapture) => self.start_capture().await?,
                Some(Command::AdjustExposure) => self.adjust_exposure().await?,
                Some(Command::FlushCheckpoint) => self.flush_checkpoint().await?,
                Some(Command::CleanExit) => {
                    self.clean_exit().await;
                    return Ok(());
                }
                None => return Err(CaptureError::UnknownCommand { byte, peer: Peer::Sequencer }),
            }
        }
    }

    /// Hand an over-capacity backlog to persistence before the next read.
    fn relieve_backpressure(&mut self) -> Result<()> {
        if self.buffer.needs_flush() {
            if let Some(range) = self.buffer.take_flush_range() {
                debug!(start = range.start, end = range.end, "Backlog over capacity");
                self.persistence.schedule(range)?;
            }
        }
        Ok(())
    }

    async fn start_capture(&mut self) -> Result<()> {
        let aux_failure = match self.aux.as_mut() {
            Some(aux) => aux.start_recording().await.err(),
            None => None,
        };
        if let Some(e) = aux_failure {
            self.detach_auxiliary(e);
        }

        let multiplier = self.multiplier.take();
        debug!(multiplier, "Start capture");
        let outcome = self.capture()?.take_picture(multiplier).await;

        match outcome {
            Ok(report) => {
                self.summary.frames_captured += 1;
                self.emit(SessionEvent::FrameReady(report.frame));
                self.primary_link()?.send(Reply::ContinueNextLight.code()).await
            }
            Err(error) if !error.is_fatal() => {
                warn!("Error taking picture: {}", error);
                self.summary.failed_shots += 1;
                self.emit_error(&error, Severity::Transient);

                let code = Reply::ErrorTakingPicture.code();
                self.primary_link()?.send(code).await?;
                let aux_failure = match self.aux.as_mut() {
                    Some(aux) => aux.send(code).await.err(),
                    None => None,
                };
                if let Some(e) = aux_failure {
                    self.detach_auxiliary(e);
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn adjust_exposure(&mut self) -> Result<()> {
        let byte = self.primary_link()?.recv().await?;
        self.multiplier = ExposureMultiplier::from_wire(byte);
        debug!(multiplier = self.multiplier.get(), "Exposure adjusted");
        self.primary_link()?.send(byte).await
    }

    async fn flush_checkpoint(&mut self) -> Result<()> {
        let report = self.persistence.flush_now().await?;
        info!(written = report.written, failed = report.failures.len(), "Checkpoint flush complete");

        // Background flushes queued before this one have reported by now
        for failure in self.queued_failures().into_iter().chain(report.failures) {
            self.report_save_failure(&failure).await?;
        }
        self.primary_link()?.send(Reply::FinishedWriting.code()).await
    }

    async fn clean_exit(&mut self) {
        info!("Clean exit requested");
        self.set_state(SessionState::Closing);
        let flushed = self.flush_best_effort().await;

        let mut reachable = true;
        for failure in self.queued_failures().into_iter().chain(flushed) {
            if !reachable {
                self.note_save_failure(&failure);
            } else if let Err(e) = self.report_save_failure(&failure).await {
                debug!("Could not report save failure to sequencer: {}", e);
                reachable = false;
            }
        }

        if let Some(mut aux) = self.aux.take() {
            let events = self.events.clone();
            let drained = aux
                .drain(|status| {
                    let _ = events.send(SessionEvent::AuxStatus(status));
                })
                .await;
            if let Err(e) = drained {
                warn!("Secondary peer did not finish cleanly: {}", e);
                self.emit_error(&e, Severity::Transient);
            }
            if let Err(e) = aux.close().await {
                debug!("Secondary peer close: {}", e);
            }
        }
    }

    /// Flush everything buffered; returns the frames that could not be written.
    async fn flush_best_effort(&mut self) -> Vec<PersistenceFailure> {
        match self.persistence.flush_now().await {
            Ok(report) => {
                info!(written = report.written, failed = report.failures.len(), "Final flush complete");
                report.failures
            }
            Err(e) => {
                warn!("Final flush failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Failures of background flushes not yet reported.
    fn queued_failures(&mut self) -> Vec<PersistenceFailure> {
        let mut queued = Vec::new();
        while let Ok(failure) = self.failures.try_recv() {
            queued.push(failure);
        }
        queued
    }

    async fn report_save_failure(&mut self, failure: &PersistenceFailure) -> Result<()> {
        self.note_save_failure(failure);
        self.primary_link()?.send(Reply::ErrorSavingPicture.code()).await
    }

    fn note_save_failure(&self, failure: &PersistenceFailure) {
        warn!(index = failure.index, "Error saving picture: {}", failure.error);
        self.emit_error(&failure.error, Severity::Transient);
    }
}
