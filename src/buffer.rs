//! Bounded in-memory frame buffer.
//!
//! Captured frames are held in memory until the persistence worker writes them.
//! The buffer tracks two cursors: the next index to capture and the next index
//! not yet handed to persistence. Their difference is the backlog, which is
//! capped: an append that pushes the backlog past capacity takes the pending
//! range on the spot and returns it to the caller as a flush signal.
//!
//! All mutation happens under one lock ([`SharedFrameBuffer`]), so a flush range
//! can never include a half-written frame pair.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::types::{ExposureRecord, Frame, FramePayload};

/// Default backlog capacity before a flush is forced.
pub const DEFAULT_CAPACITY: usize = 8;

/// Capture and flush cursors.
///
/// Invariant: `next_unflushed <= next_capture`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCursor {
    pub next_unflushed: u32,
    pub next_capture: u32,
}

impl SessionCursor {
    /// Captured frames not yet handed to persistence.
    pub fn backlog(&self) -> usize {
        (self.next_capture - self.next_unflushed) as usize
    }
}

/// Half-open index range `[start, end)` handed to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRange {
    pub start: u32,
    pub end: u32,
}

impl FlushRange {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn indices(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }
}

/// Result of [`FrameBuffer::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Index assigned to the appended frame
    pub index: u32,
    /// Set when the backlog exceeded capacity; the range is already taken
    pub flush: Option<FlushRange>,
}

#[derive(Debug)]
struct FrameSlot {
    exposure: ExposureRecord,
    payload: Option<FramePayload>,
}

/// Indexed store of captured frames with a backlog cap.
#[derive(Debug)]
pub struct FrameBuffer {
    slots: Vec<FrameSlot>,
    cursor: SessionCursor,
    capacity: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FrameBuffer {
    /// Create a buffer; a capacity of zero is raised to 1.
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::new(), cursor: SessionCursor::default(), capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> SessionCursor {
        self.cursor
    }

    pub fn backlog(&self) -> usize {
        self.cursor.backlog()
    }

    /// Whether the backlog is above capacity.
    pub fn needs_flush(&self) -> bool {
        self.backlog() > self.capacity
    }

    /// Store a frame at `next_capture`. Never blocks on I/O.
    pub fn append(&mut self, payload: FramePayload) -> AppendOutcome {
        let index = self.cursor.next_capture;
        trace!(index, bytes = payload.len(), "Buffering frame");

        self.slots.push(FrameSlot { exposure: payload.exposure, payload: Some(payload) });
        self.cursor.next_capture += 1;

        let flush = if self.needs_flush() {
            debug!(backlog = self.backlog(), capacity = self.capacity, "Too many frames in memory");
            self.take_flush_range()
        } else {
            None
        };

        AppendOutcome { index, flush }
    }

    /// Take `[next_unflushed, next_capture)` and advance `next_unflushed`.
    ///
    /// Returns `None` when nothing is pending.
    pub fn take_flush_range(&mut self) -> Option<FlushRange> {
        let range = FlushRange { start: self.cursor.next_unflushed, end: self.cursor.next_capture };
        if range.is_empty() {
            return None;
        }
        self.cursor.next_unflushed = range.end;
        Some(range)
    }

    /// Frame at `index`, if its payload is still held in memory.
    pub fn frame(&self, index: u32) -> Option<Frame> {
        let slot = self.slots.get(index as usize)?;
        slot.payload.clone().map(|payload| Frame { index, payload })
    }

    /// Exposure recorded for `index`; kept after the payload is released.
    pub fn exposure(&self, index: u32) -> Option<ExposureRecord> {
        self.slots.get(index as usize).map(|slot| slot.exposure)
    }

    /// Drop the payload of `index`, keeping the slot for bookkeeping.
    ///
    /// Returns whether a payload was held.
    pub fn release(&mut self, index: u32) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot) => {
                let held = slot.payload.take().is_some();
                if held {
                    trace!(index, "Released frame payload");
                }
                held
            }
            None => false,
        }
    }

    /// Number of slots whose payload is still in memory.
    pub fn resident(&self) -> usize {
        self.slots.iter().filter(|slot| slot.payload.is_some()).count()
    }

    /// Bytes currently held in memory.
    pub fn resident_bytes(&self) -> usize {
        self.slots.iter().filter_map(|slot| slot.payload.as_ref()).map(FramePayload::len).sum()
    }
}

/// Frame buffer shared between the capture driver and the persistence worker.
#[derive(Debug, Clone, Default)]
pub struct SharedFrameBuffer {
    inner: Arc<Mutex<FrameBuffer>>,
}

impl SharedFrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(FrameBuffer::new(capacity))) }
    }

    /// Lock the buffer.
    ///
    /// A panic while holding the lock cannot leave the cursors inconsistent
    /// (each mutation is a single assignment), so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, payload: FramePayload) -> AppendOutcome {
        self.lock().append(payload)
    }

    pub fn take_flush_range(&self) -> Option<FlushRange> {
        self.lock().take_flush_range()
    }

    pub fn frame(&self, index: u32) -> Option<Frame> {
        self.lock().frame(index)
    }

    pub fn release(&self, index: u32) -> bool {
        self.lock().release(index)
    }

    pub fn cursor(&self) -> SessionCursor {
        self.lock().cursor()
    }

    pub fn needs_flush(&self) -> bool {
        self.lock().needs_flush()
    }
}
