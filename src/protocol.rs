//! Single-byte wire protocol spoken with the sequencer and the secondary peer.
//!
//! Every message is one signed byte on a stream socket. Commands that carry an
//! operand (only ADJUST_EXPOSURE) read it as the immediately following byte.
//! There is no length prefix and no resynchronization: an unexpected byte is a
//! framing error.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{CaptureError, Result};

/// Default sequencer port.
pub const SEQUENCER_PORT: u16 = 50007;

/// Default port of the optional secondary peer.
pub const AUXILIARY_PORT: u16 = 50008;

/// Remote end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// The light rig driving the session
    Sequencer,
    /// Optional secondary recording device
    Auxiliary,
    Unknown,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Peer::Sequencer => "sequencer",
            Peer::Auxiliary => "secondary peer",
            Peer::Unknown => "unknown peer",
        })
    }
}

/// Commands sent by the sequencer once the session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Trigger one shot
    StartCapture,
    /// Next byte is the exposure multiplier for the next shot
    AdjustExposure,
    /// Polarizer starts rotating; flush buffered frames now
    FlushCheckpoint,
    /// Terminate the session
    CleanExit,
}

impl Command {
    pub const fn code(self) -> i8 {
        match self {
            Command::StartCapture => 2,
            Command::FlushCheckpoint => 3,
            Command::AdjustExposure => 4,
            Command::CleanExit => -1,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            2 => Some(Command::StartCapture),
            3 => Some(Command::FlushCheckpoint),
            4 => Some(Command::AdjustExposure),
            -1 => Some(Command::CleanExit),
            _ => None,
        }
    }
}

/// Replies sent to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    /// Shot complete, ready for the next light
    ContinueNextLight,
    /// Checkpoint flush finished
    FinishedWriting,
    ErrorTakingPicture,
    ErrorSavingPicture,
}

impl Reply {
    pub const fn code(self) -> i8 {
        match self {
            Reply::ContinueNextLight => 3,
            Reply::FinishedWriting => 44,
            Reply::ErrorSavingPicture => -2,
            Reply::ErrorTakingPicture => -3,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Reply::ContinueNextLight => "ready for next light",
            Reply::FinishedWriting => "finished writing images",
            Reply::ErrorTakingPicture => "error taking picture",
            Reply::ErrorSavingPicture => "error saving picture",
        }
    }
}

/// Commands sent to the secondary peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxCommand {
    Init,
    StartRecording,
    Shutdown,
}

impl AuxCommand {
    pub const fn code(self) -> i8 {
        match self {
            AuxCommand::Init => 1,
            AuxCommand::StartRecording => 2,
            AuxCommand::Shutdown => -1,
        }
    }
}

/// Replies from the secondary peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxReply {
    /// Acknowledges init
    Ready,
    /// Still flushing its recording
    Writing,
    /// Shutdown finished
    ShutdownComplete,
    Other(i8),
}

impl AuxReply {
    pub fn from_code(code: i8) -> Self {
        match code {
            1 => AuxReply::Ready,
            2 => AuxReply::Writing,
            -1 => AuxReply::ShutdownComplete,
            other => AuxReply::Other(other),
        }
    }
}

/// Read one protocol byte.
pub async fn read_byte<R>(reader: &mut R) -> std::io::Result<i8>
where
    R: AsyncRead + Unpin,
{
    reader.read_i8().await
}

/// Write one protocol byte and flush it to the wire.
pub async fn write_byte<W>(writer: &mut W, byte: i8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i8(byte).await?;
    writer.flush().await
}

/// Byte-framed link to one peer; I/O failures become [`CaptureError::ConnectionLost`].
pub struct PeerLink<S> {
    stream: S,
    peer: Peer,
}

impl<S> PeerLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: Peer) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub async fn recv(&mut self) -> Result<i8> {
        let byte = read_byte(&mut self.stream)
            .await
            .map_err(|e| CaptureError::connection_lost(self.peer, e))?;
        trace!(peer = %self.peer, byte, "received");
        Ok(byte)
    }

    pub async fn send(&mut self, byte: i8) -> Result<()> {
        trace!(peer = %self.peer, byte, "sending");
        write_byte(&mut self.stream, byte)
            .await
            .map_err(|e| CaptureError::connection_lost(self.peer, e))
    }

    /// Shut down the write half; the stream is released when the link drops.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(|e| CaptureError::connection_lost(self.peer, e))
    }
}
