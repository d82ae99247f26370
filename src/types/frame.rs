//! Captured frame types

use std::sync::Arc;

use super::{CameraMetadata, ExposureRecord};

/// Raw sensor payload plus the camera metadata needed to encode it.
#[derive(Debug, Clone)]
pub struct AuxiliaryPayload {
    pub data: Arc<[u8]>,
    pub metadata: Arc<CameraMetadata>,
}

/// Payloads produced by one still capture, before an index is assigned.
#[derive(Debug, Clone)]
pub struct FramePayload {
    /// Encoded image (zero-copy via Arc)
    pub primary: Arc<[u8]>,

    /// Uncompressed sensor data, when auxiliary capture is enabled
    pub auxiliary: Option<AuxiliaryPayload>,

    pub exposure: ExposureRecord,
}

impl FramePayload {
    pub fn new(primary: Vec<u8>, exposure: ExposureRecord) -> Self {
        Self { primary: primary.into(), auxiliary: None, exposure }
    }

    pub fn with_auxiliary(mut self, data: Vec<u8>, metadata: Arc<CameraMetadata>) -> Self {
        self.auxiliary = Some(AuxiliaryPayload { data: data.into(), metadata });
        self
    }

    /// Total bytes held in memory by this payload.
    pub fn len(&self) -> usize {
        self.primary.len() + self.auxiliary.as_ref().map_or(0, |aux| aux.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One captured frame addressed by its session-local index.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic index, starting at 0 per session
    pub index: u32,
    pub payload: FramePayload,
}

impl Frame {
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            index: self.index,
            primary_len: self.payload.primary.len(),
            auxiliary_len: self.payload.auxiliary.as_ref().map(|aux| aux.data.len()),
            exposure: self.payload.exposure,
        }
    }
}

/// Lightweight frame summary for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: u32,
    pub primary_len: usize,
    pub auxiliary_len: Option<usize>,
    pub exposure: ExposureRecord,
}
