//! Capture-sequencing engine for multi-light photometric rigs.
//!
//! Lightstage lets an external light sequencer drive a camera through a burst
//! of exposures over a socket, one shot per light configuration, without
//! losing frames or running out of memory.
//!
//! # Features
//!
//! - **Capture state machine**: focus lock, precapture and still capture per shot
//! - **Single-byte protocol**: handshake, commands and replies to the sequencer
//! - **Bounded frame buffer**: backpressure hands overflow to a background writer
//! - **Secondary peer**: optional second recorder that follows the session
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use lightstage::devices::ScriptedDevice;
//! use lightstage::{DirectoryStore, Lightstage, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> lightstage::Result<()> {
//!     lightstage::logging::init("lightstage=info");
//!
//!     let config = SessionConfig::from_file("lightstage.yaml").await?;
//!     let store = DirectoryStore::new(&config.output_dir);
//!     let mut session = Lightstage::connect(config, ScriptedDevice::new(), store).await?;
//!
//!     let mut events = Box::pin(session.subscribe());
//!     tokio::spawn(async move {
//!         while let Some(event) = events.next().await {
//!             if let SessionEvent::FrameReady(frame) = event {
//!                 println!("frame {} ({} bytes)", frame.index, frame.primary_len);
//!             }
//!         }
//!     });
//!
//!     let summary = session.run().await?;
//!     println!("{} frames written", summary.frames_written);
//!     Ok(())
//! }
//! ```

mod error;
pub mod types;

pub mod buffer;
pub mod capture;
pub mod config;
pub mod device;
pub mod devices;
pub mod logging;
pub mod persistence;
pub mod protocol;
pub mod session;

// Core exports
pub use error::*;
pub use types::*;

pub use buffer::{FrameBuffer, SessionCursor, SharedFrameBuffer};
pub use capture::{CaptureDriver, CaptureHandle, CaptureStateMachine};
pub use config::{CaptureSettings, SessionConfig};
pub use device::{CaptureDevice, CaptureRequest, DeviceEvent};
pub use persistence::{DirectoryStore, FrameStore, MemoryStore, PersistenceWorker};
pub use session::{SequencerSession, SessionEvent, SessionState, SessionSummary, Severity};

use tokio::net::TcpStream;

/// Unified entry point for sequencer sessions.
///
/// # Examples
///
/// ```rust,no_run
/// use lightstage::devices::ScriptedDevice;
/// use lightstage::{Lightstage, MemoryStore, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> lightstage::Result<()> {
///     let config = SessionConfig { host: "192.168.4.1".into(), ..Default::default() };
///     let mut session = Lightstage::connect(config, ScriptedDevice::new(), MemoryStore::new()).await?;
///     session.run().await?;
///     Ok(())
/// }
/// ```
pub struct Lightstage;

impl Lightstage {
    /// Connect to the sequencer (and the secondary peer, if it listens) and
    /// open the camera.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The host cannot be resolved or refuses the connection
    /// - The camera cannot be opened within the configured timeout
    pub async fn connect<D, F>(
        config: SessionConfig,
        device: D,
        store: F,
    ) -> Result<SequencerSession<TcpStream>>
    where
        D: CaptureDevice,
        F: FrameStore,
    {
        SequencerSession::connect(config, device, store).await
    }
}
