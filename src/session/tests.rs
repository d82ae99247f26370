//! Session tests over in-memory duplex streams
//!
//! A scripted sequencer (and optionally a secondary peer) drives the session
//! through the single-byte protocol while a scripted camera produces frames.

use super::*;
use crate::devices::{ScriptHandle, ScriptedDevice};
use crate::persistence::MemoryStore;
use crate::protocol::{AuxCommand, read_byte, write_byte};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::DuplexStream;

/// Remote end of a duplex link, playing the sequencer or the secondary peer.
struct Remote {
    stream: DuplexStream,
}

impl Remote {
    async fn send(&mut self, byte: i8) {
        write_byte(&mut self.stream, byte).await.expect("remote write");
    }

    async fn recv(&mut self) -> i8 {
        tokio::time::timeout(Duration::from_secs(5), read_byte(&mut self.stream))
            .await
            .expect("remote read timed out")
            .expect("remote read")
    }

    async fn expect(&mut self, byte: i8) {
        assert_eq!(self.recv().await, byte);
    }

    /// Echo the shot mode byte back.
    async fn accept_handshake(&mut self) -> i8 {
        let mode = self.recv().await;
        self.send(mode).await;
        mode
    }

    async fn shoot(&mut self) -> i8 {
        self.send(Command::StartCapture.code()).await;
        self.recv().await
    }
}

struct Harness {
    session: SequencerSession<DuplexStream>,
    sequencer: Remote,
    aux: Option<Remote>,
    camera: ScriptHandle,
    store: MemoryStore,
}

fn test_config() -> SessionConfig {
    SessionConfig {
        shot_mode: ShotMode::CrossPolarizedOnly,
        shot_timeout_ms: 500,
        ..Default::default()
    }
}

async fn harness(config: SessionConfig, device: ScriptedDevice, with_aux: bool) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();

    let camera = device.handle();
    let store = MemoryStore::new();
    let (local, remote) = tokio::io::duplex(64);
    let (aux_local, aux) = if with_aux {
        let (local, remote) = tokio::io::duplex(64);
        (Some(local), Some(Remote { stream: remote }))
    } else {
        (None, None)
    };

    let session = SequencerSession::with_streams(config, device, store.clone(), local, aux_local)
        .await
        .expect("session should build");

    Harness { session, sequencer: Remote { stream: remote }, aux, camera, store }
}

fn frame_events(events: &[SessionEvent]) -> Vec<FrameInfo> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::FrameReady(info) => Some(*info),
            _ => None,
        })
        .collect()
}

async fn collect_events(
    mut stream: impl Stream<Item = SessionEvent> + Unpin,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), stream.next()).await
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn handshake_mismatch_closes_without_running() {
    let Harness { mut session, mut sequencer, camera, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;
    let events = Box::pin(session.subscribe());

    let remote = tokio::spawn(async move {
        let mode = sequencer.recv().await;
        assert_eq!(mode, 12);
        sequencer.send(13).await;
    });

    let error = session.run().await.unwrap_err();
    remote.await.unwrap();

    assert!(matches!(error, CaptureError::Handshake { sent: 12, received: 13 }));
    assert!(error.is_fatal());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(camera.is_closed());

    let events = collect_events(events).await;
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::StateChanged(SessionState::Running))));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error { severity: Severity::Fatal, .. })));
}

#[tokio::test]
async fn exposure_multiplier_applies_to_exactly_one_shot() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;
    let events = Box::pin(session.subscribe());

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;

        sequencer.send(Command::AdjustExposure.code()).await;
        sequencer.send(3).await;
        sequencer.expect(3).await;

        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();

    assert_eq!(summary.frames_captured, 2);
    assert_eq!(summary.frames_written, 2);
    assert_eq!(summary.shot_mode, ShotMode::CrossPolarizedOnly);

    let frames = frame_events(&collect_events(events).await);
    let multipliers: Vec<_> = frames.iter().map(|f| f.exposure.multiplier).collect();
    assert_eq!(multipliers, vec![3, 1]);
    assert_eq!(frames[0].exposure.exposure_time_ns, 600_000_000);

    // Primary and raw payload per frame
    assert_eq!(store.len(), 4);
    assert!(store.names().iter().any(|name| name.ends_with("_0001.dng")));
}

#[tokio::test]
async fn clean_exit_flushes_remaining_frames_without_aux() {
    let Harness { mut session, mut sequencer, camera, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;
    let mut states = Box::pin(session.state_changes());
    assert_eq!(states.next().await, Some(SessionState::Connecting));

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.shoot().await;
        sequencer.shoot().await;
        sequencer.send(Command::CleanExit.code()).await;
        sequencer
    });

    let summary = session.run().await.unwrap();
    let mut sequencer = remote.await.unwrap();

    assert_eq!(summary.frames_written, 2);
    assert_eq!(store.len(), 4);
    assert_eq!(session.cursor(), SessionCursor { next_unflushed: 2, next_capture: 2 });
    assert_eq!(session.state(), SessionState::Closed);
    assert!(camera.is_closed());

    // Socket closed after exit
    let mut rest = [0u8; 1];
    let read = tokio::io::AsyncReadExt::read(&mut sequencer.stream, &mut rest).await.unwrap();
    assert_eq!(read, 0);

    // close is idempotent
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn checkpoint_flushes_and_reports_finished() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;
    let written = store.clone();

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        for _ in 0..3 {
            sequencer.shoot().await;
        }
        sequencer.send(Command::FlushCheckpoint.code()).await;
        sequencer.expect(Reply::FinishedWriting.code()).await;
        // Everything captured so far is on storage when 44 arrives
        assert_eq!(written.len(), 6);
        sequencer.send(Command::CleanExit.code()).await;
    });

    session.run().await.unwrap();
    remote.await.unwrap();
    assert_eq!(store.len(), 6);
}

#[tokio::test]
async fn save_failure_reported_before_finished_writing() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;
    let events = Box::pin(session.subscribe());

    store.fail_on("_0000.jpg");
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.shoot().await;
        sequencer.send(Command::FlushCheckpoint.code()).await;
        sequencer.expect(Reply::ErrorSavingPicture.code()).await;
        sequencer.expect(Reply::FinishedWriting.code()).await;
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();

    assert_eq!(summary.frames_captured, 1);
    assert_eq!(summary.failed_writes, 1);
    let events = collect_events(events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Error { code: Some(-2), severity: Severity::Transient, .. }
    )));
}

#[tokio::test]
async fn background_save_failure_reported_before_checkpoint_ack() {
    let config = SessionConfig { buffer_capacity: 1, capture_auxiliary: false, ..test_config() };
    let Harness { mut session, mut sequencer, store, .. } =
        harness(config, ScriptedDevice::new(), false).await;

    store.fail_on("_0000.jpg");
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        // The second frame overflows the buffer and [0, 2) is written in the background
        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        sequencer.send(Command::FlushCheckpoint.code()).await;

        let mut replies = Vec::new();
        loop {
            let byte = sequencer.recv().await;
            replies.push(byte);
            if byte == Reply::FinishedWriting.code() {
                break;
            }
        }
        sequencer.send(Command::CleanExit.code()).await;
        replies
    });

    let summary = session.run().await.unwrap();
    let replies = remote.await.unwrap();

    assert_eq!(replies, vec![Reply::ErrorSavingPicture.code(), Reply::FinishedWriting.code()]);
    assert_eq!(summary.failed_writes, 1);
    assert_eq!(summary.frames_written, 1);
}

#[tokio::test]
async fn save_failure_on_exit_reported_before_close() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;

    store.fail_on("_0000.jpg");
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.shoot().await;
        sequencer.send(Command::CleanExit.code()).await;

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut sequencer.stream, &mut rest).await.unwrap();
        rest
    });

    let summary = session.run().await.unwrap();
    let rest = remote.await.unwrap();

    assert_eq!(rest, vec![Reply::ErrorSavingPicture.code() as u8]);
    assert_eq!(summary.failed_writes, 1);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn device_failure_reports_error_and_continues() {
    let Harness { mut session, mut sequencer, mut aux, camera, .. } =
        harness(test_config(), ScriptedDevice::new(), true).await;
    camera.fail_next_stills(1);
    let mut aux = aux.take().unwrap();

    let aux_task = tokio::spawn(async move {
        aux.expect(AuxCommand::Init.code()).await;
        aux.send(1).await;
        aux.expect(AuxCommand::StartRecording.code()).await;
        aux.expect(Reply::ErrorTakingPicture.code()).await;
        aux.expect(AuxCommand::Shutdown.code()).await;
        aux.send(-1).await;
    });
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        assert_eq!(sequencer.shoot().await, Reply::ErrorTakingPicture.code());
        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();
    aux_task.await.unwrap();

    assert_eq!(summary.failed_shots, 1);
    assert_eq!(summary.frames_captured, 1);
    assert_eq!(session.cursor().next_capture, 1);
}

#[tokio::test]
async fn aux_peer_records_once_and_drains_on_exit() {
    let Harness { mut session, mut sequencer, mut aux, .. } =
        harness(test_config(), ScriptedDevice::new(), true).await;
    let events = Box::pin(session.subscribe());
    let mut aux = aux.take().unwrap();

    let aux_task = tokio::spawn(async move {
        aux.expect(1).await;
        aux.send(1).await;
        aux.expect(2).await;
        // Only one start-recording for the whole session, then the shutdown request
        aux.expect(-1).await;
        aux.send(2).await;
        aux.send(2).await;
        aux.send(-1).await;
    });
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        for _ in 0..3 {
            sequencer.shoot().await;
        }
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();
    aux_task.await.unwrap();

    assert_eq!(summary.frames_captured, 3);
    let events = collect_events(events).await;
    let writing = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::AuxStatus(AuxReply::Writing)))
        .count();
    assert_eq!(writing, 2);
}

#[tokio::test]
async fn wrong_aux_ack_continues_without_aux() {
    let Harness { mut session, mut sequencer, mut aux, .. } =
        harness(test_config(), ScriptedDevice::new(), true).await;
    let mut aux = aux.take().unwrap();

    let aux_task = tokio::spawn(async move {
        aux.expect(1).await;
        aux.send(5).await;
        aux
    });
    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();
    let mut aux = aux_task.await.unwrap();

    assert_eq!(summary.frames_captured, 1);
    // Nothing further was sent to the rejected peer
    let mut rest = [0u8; 1];
    let read = tokio::io::AsyncReadExt::read(&mut aux.stream, &mut rest).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn unknown_command_is_fatal_after_best_effort_flush() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.shoot().await;
        sequencer.send(99).await;
    });

    let error = session.run().await.unwrap_err();
    remote.await.unwrap();

    assert!(matches!(error, CaptureError::UnknownCommand { byte: 99, peer: Peer::Sequencer }));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn lost_sequencer_is_fatal_after_best_effort_flush() {
    let Harness { mut session, mut sequencer, store, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.shoot().await;
        drop(sequencer);
    });

    let error = session.run().await.unwrap_err();
    remote.await.unwrap();

    assert!(matches!(error, CaptureError::ConnectionLost { peer: Peer::Sequencer, .. }));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn backlog_is_flushed_in_background() {
    let config = SessionConfig { buffer_capacity: 2, capture_auxiliary: false, ..test_config() };
    let Harness { mut session, mut sequencer, store, .. } =
        harness(config, ScriptedDevice::new(), false).await;
    let written = store.clone();

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        for _ in 0..5 {
            assert_eq!(sequencer.shoot().await, Reply::ContinueNextLight.code());
        }
        // The overflow at the third shot was written without a checkpoint
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(written.len() >= 3);
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();

    assert_eq!(summary.frames_written, 5);
    assert_eq!(store.len(), 5);
    assert!(store.names().iter().all(|name| name.ends_with(".jpg")));
}

#[tokio::test]
async fn burst_session_never_locks_focus() {
    let config = SessionConfig { burst_mode: true, ..test_config() };
    let Harness { mut session, mut sequencer, camera, .. } =
        harness(config, ScriptedDevice::new(), false).await;

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        for _ in 0..4 {
            sequencer.shoot().await;
        }
        sequencer.send(Command::CleanExit.code()).await;
    });

    let summary = session.run().await.unwrap();
    remote.await.unwrap();

    assert_eq!(summary.frames_captured, 4);
    assert!(camera.requests().iter().all(|r| r.kind != crate::device::RequestKind::LockFocus));
}

#[tokio::test]
async fn slow_camera_open_fails_session_start() {
    let config = SessionConfig { device_open_timeout_ms: 20, ..test_config() };
    let device = ScriptedDevice::new().with_open_delay(Duration::from_secs(60));
    let (local, _remote) = tokio::io::duplex(64);

    let result =
        SequencerSession::with_streams(config, device, MemoryStore::new(), local, None).await;
    assert!(matches!(result, Err(CaptureError::Timeout { .. })));
}

#[tokio::test]
async fn session_runs_only_once() {
    let Harness { mut session, mut sequencer, .. } =
        harness(test_config(), ScriptedDevice::new(), false).await;

    let remote = tokio::spawn(async move {
        sequencer.accept_handshake().await;
        sequencer.send(Command::CleanExit.code()).await;
    });
    session.run().await.unwrap();
    remote.await.unwrap();

    assert!(matches!(session.run().await, Err(CaptureError::Shutdown { .. })));
}
