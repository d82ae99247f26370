//! Secondary peer link

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::protocol::{AuxCommand, AuxReply, Peer, PeerLink};
use crate::{CaptureError, Result};

/// Optional secondary recording device that follows the session.
pub(crate) struct AuxiliaryPeer<S> {
    link: PeerLink<S>,
    recording: bool,
}

impl<S> AuxiliaryPeer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send init and require the ready acknowledgement.
    pub(crate) async fn init(stream: S) -> Result<Self> {
        let mut link = PeerLink::new(stream, Peer::Auxiliary);
        link.send(AuxCommand::Init.code()).await?;

        match AuxReply::from_code(link.recv().await?) {
            AuxReply::Ready => {
                info!("Secondary peer ready");
                Ok(Self { link, recording: false })
            }
            other => Err(CaptureError::protocol(format!(
                "secondary peer answered init with {other:?}"
            ))),
        }
    }

    /// Ask the peer to start recording. Only the first call is sent.
    pub(crate) async fn start_recording(&mut self) -> Result<()> {
        if self.recording {
            return Ok(());
        }
        self.recording = true;
        debug!("Starting secondary recording");
        self.link.send(AuxCommand::StartRecording.code()).await
    }

    pub(crate) async fn send(&mut self, byte: i8) -> Result<()> {
        self.link.send(byte).await
    }

    /// Request shutdown and read replies until the peer reports it is done.
    ///
    /// Every other reply is passed to `on_status`.
    pub(crate) async fn drain(&mut self, mut on_status: impl FnMut(AuxReply)) -> Result<()> {
        self.link.send(AuxCommand::Shutdown.code()).await?;

        loop {
            match AuxReply::from_code(self.link.recv().await?) {
                AuxReply::ShutdownComplete => {
                    info!("Secondary peer finished");
                    return Ok(());
                }
                AuxReply::Writing => {
                    debug!("Secondary peer still writing");
                    on_status(AuxReply::Writing);
                }
                other => {
                    warn!(reply = ?other, "Unexpected reply from secondary peer");
                    on_status(other);
                }
            }
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        self.link.shutdown().await
    }
}
