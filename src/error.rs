//! Error types for capture sequencing.
//!
//! This module provides the error taxonomy for the lightstage engine. All errors
//! implement the `std::error::Error` trait and carry structured context so the
//! session loop can decide whether a failure ends the session or only the shot.
//!
//! ## Error Categories
//!
//! - **Device Errors**: camera open/configure/capture failures (abort the shot only)
//! - **Protocol Errors**: malformed handshake echo or unrecognized command byte (fatal)
//! - **Network Errors**: unknown host, refused connection, lost socket (fatal)
//! - **Persistence Errors**: a single frame could not be written (reported, non-fatal)
//! - **Configuration Errors**: invalid or unreadable session configuration
//!
//! ## Fatal vs. Transient
//!
//! ```rust
//! use lightstage::CaptureError;
//!
//! let error = CaptureError::device_failure("capture", "sensor busy");
//! assert!(!error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{self, Peer};
use crate::types::CaptureState;

/// Result type alias for capture operations.
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Coarse classification used for reporting and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Device,
    Protocol,
    Network,
    Persistence,
    Config,
    Internal,
}

/// Main error type for capture sequencing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("Camera device error during {operation}: {reason}")]
    Device {
        operation: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cannot {operation} while capture state is {state}")]
    InvalidState { operation: &'static str, state: CaptureState },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Handshake failed: sent shot mode {sent}, sequencer answered {received}")]
    Handshake { sent: i8, received: i8 },

    #[error("Unrecognized command byte {byte} from {peer}")]
    UnknownCommand { byte: i8, peer: Peer },

    #[error("Protocol error: {details}")]
    Protocol { details: String },

    #[error("Don't know about host: {host}")]
    UnknownHost {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to connect to {address}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost connection to {peer}")]
    ConnectionLost {
        peer: Peer,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write frame {index} to {path}")]
    Persistence {
        index: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{component} has shut down")]
    Shutdown { component: &'static str },
}

impl CaptureError {
    /// Returns the coarse category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::Device { .. } | CaptureError::InvalidState { .. } => {
                ErrorCategory::Device
            }
            CaptureError::Timeout { .. } => ErrorCategory::Device,
            CaptureError::Handshake { .. }
            | CaptureError::UnknownCommand { .. }
            | CaptureError::Protocol { .. } => ErrorCategory::Protocol,
            CaptureError::UnknownHost { .. }
            | CaptureError::Connection { .. }
            | CaptureError::ConnectionLost { .. } => ErrorCategory::Network,
            CaptureError::Persistence { .. } => ErrorCategory::Persistence,
            CaptureError::Config { .. } => ErrorCategory::Config,
            CaptureError::Shutdown { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns whether this error must terminate the sequencer session.
    ///
    /// Device and persistence failures only cost a single shot or frame; protocol,
    /// network, configuration and shutdown errors end the session.
    pub fn is_fatal(&self) -> bool {
        match self.category() {
            ErrorCategory::Device | ErrorCategory::Persistence => false,
            ErrorCategory::Protocol
            | ErrorCategory::Network
            | ErrorCategory::Config
            | ErrorCategory::Internal => true,
        }
    }

    /// Returns whether the operator can reasonably re-trigger the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Device { .. } => true,
            CaptureError::InvalidState { .. } => true,
            CaptureError::Timeout { .. } => true,
            CaptureError::Connection { .. } => true,
            CaptureError::ConnectionLost { .. } => true,
            CaptureError::Persistence { .. } => true,
            CaptureError::Handshake { .. } => false,
            CaptureError::UnknownCommand { .. } => false,
            CaptureError::Protocol { .. } => false,
            CaptureError::UnknownHost { .. } => false,
            CaptureError::Config { .. } => false,
            CaptureError::Shutdown { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CaptureError::Device { .. } => vec![
                "Check that no other application holds the camera",
                "Verify the lens is not obstructed and the sensor is idle",
                "Re-trigger the capture from the sequencer",
            ],
            CaptureError::InvalidState { .. } => vec![
                "Wait for the current shot to complete before requesting another",
                "Return the camera to preview and retry",
            ],
            CaptureError::Timeout { .. } => vec![
                "Close other applications that may hold the camera",
                "Increase the configured timeout",
                "Restart the camera service",
            ],
            CaptureError::Handshake { .. } => vec![
                "Check that the sequencer supports the selected shot mode",
                "Verify both ends run a compatible protocol version",
            ],
            CaptureError::UnknownCommand { .. } | CaptureError::Protocol { .. } => vec![
                "Verify the sequencer firmware matches this protocol version",
                "Restart the sequencer and start a new session",
            ],
            CaptureError::UnknownHost { .. } => vec![
                "Check the sequencer host name or address",
                "Verify the device is on the same network as the sequencer",
            ],
            CaptureError::Connection { .. } | CaptureError::ConnectionLost { .. } => vec![
                "Ensure the sequencer is powered and listening",
                "Check the network link between camera and sequencer",
                "Start a new session from the camera",
            ],
            CaptureError::Persistence { .. } => vec![
                "Ensure sufficient storage space",
                "Check output directory permissions",
                "Repeat the affected light configuration",
            ],
            CaptureError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare values against the documented defaults",
            ],
            CaptureError::Shutdown { .. } => vec![
                "Start a new session",
                "Check the log for the error that stopped the component",
            ],
        }
    }

    /// Wire code reported to the sequencer for non-fatal failures, if any.
    pub fn wire_code(&self) -> Option<i8> {
        match self.category() {
            ErrorCategory::Device => Some(protocol::Reply::ErrorTakingPicture.code()),
            ErrorCategory::Persistence => Some(protocol::Reply::ErrorSavingPicture.code()),
            _ => None,
        }
    }

    /// Helper constructor for device errors.
    pub fn device_failure(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::Device { operation: operation.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for device errors with source.
    pub fn device_failure_with_source(
        operation: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CaptureError::Device {
            operation: operation.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        CaptureError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for connection failures.
    pub fn connection_failed(address: impl Into<String>, source: std::io::Error) -> Self {
        CaptureError::Connection { address: address.into(), source }
    }

    /// Helper constructor for a lost peer connection.
    pub fn connection_lost(peer: Peer, source: std::io::Error) -> Self {
        CaptureError::ConnectionLost { peer, source }
    }

    /// Helper constructor for frame write failures.
    pub fn persistence_failed(index: u32, path: PathBuf, source: std::io::Error) -> Self {
        CaptureError::Persistence { index, path, source }
    }

    /// Helper constructor for protocol violations.
    pub fn protocol(details: impl Into<String>) -> Self {
        CaptureError::Protocol { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CaptureError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CaptureError::Config { reason: reason.into(), source: Some(source) }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::ConnectionLost { peer: Peer::Unknown, source: err }
    }
}
