//! Background persistence of buffered frames.
//!
//! A single worker task drains flush ranges from the shared [`FrameBuffer`] in
//! FIFO order. Payloads are cloned (Arc, zero-copy) under the buffer lock and
//! written outside it, so capture never waits on storage.
//!
//! [`FrameBuffer`]: crate::buffer::FrameBuffer

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{FlushRange, SharedFrameBuffer};
use crate::types::Frame;
use crate::{CaptureError, Result};

/// Destination for encoded frame bytes.
#[async_trait::async_trait]
pub trait FrameStore: Send + 'static {
    /// Write one named object, replacing any existing one.
    async fn write_bytes(&mut self, name: &str, payload: &[u8]) -> std::io::Result<()>;

    /// Where `name` ends up, for error reports.
    fn location(&self, name: &str) -> PathBuf {
        PathBuf::from(name)
    }
}

/// Store writing files into a directory, created on first write.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    created: bool,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), created: false }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl FrameStore for DirectoryStore {
    async fn write_bytes(&mut self, name: &str, payload: &[u8]) -> std::io::Result<()> {
        if !self.created {
            tokio::fs::create_dir_all(&self.root).await?;
            self.created = true;
        }
        tokio::fs::write(self.root.join(name), payload).await
    }

    fn location(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// In-memory store, for dry runs and tests.
///
/// Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryContents>>,
}

#[derive(Debug, Default)]
struct MemoryContents {
    objects: BTreeMap<String, Arc<[u8]>>,
    failing: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write whose name ends with `suffix` fail.
    pub fn fail_on(&self, suffix: impl Into<String>) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failing.push(suffix.into());
    }

    pub fn get(&self, name: &str) -> Option<Arc<[u8]>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).objects.get(name).cloned()
    }

    /// Stored names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl FrameStore for MemoryStore {
    async fn write_bytes(&mut self, name: &str, payload: &[u8]) -> std::io::Result<()> {
        let mut contents = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if contents.failing.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "write refused"));
        }
        contents.objects.insert(name.to_string(), Arc::from(payload));
        Ok(())
    }
}

/// File names for one session: `{YYYYMMDD_HHMMSS}_{index:04}.jpg` / `.dng`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNaming {
    stamp: String,
}

impl FrameNaming {
    pub fn new(started: DateTime<Local>) -> Self {
        Self { stamp: started.format("%Y%m%d_%H%M%S").to_string() }
    }

    /// Naming with an explicit session stamp.
    pub fn with_stamp(stamp: impl Into<String>) -> Self {
        Self { stamp: stamp.into() }
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    pub fn primary(&self, index: u32) -> String {
        format!("{}_{:04}.jpg", self.stamp, index)
    }

    pub fn auxiliary(&self, index: u32) -> String {
        format!("{}_{:04}.dng", self.stamp, index)
    }
}

impl Default for FrameNaming {
    fn default() -> Self {
        Self::new(Local::now())
    }
}

/// A frame that could not be written. Its payload has been dropped.
#[derive(Debug)]
pub struct PersistenceFailure {
    pub index: u32,
    pub error: CaptureError,
}

/// Outcome of a synchronous flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub range: Option<FlushRange>,
    pub written: u32,
    pub failures: Vec<PersistenceFailure>,
}

/// Totals over the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistenceStats {
    pub frames_written: u32,
    pub failed_writes: u32,
}

struct FlushJob {
    range: Option<FlushRange>,
    reply: Option<oneshot::Sender<FlushReport>>,
}

/// Handle for scheduling flushes on the worker.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    jobs: mpsc::UnboundedSender<FlushJob>,
    buffer: SharedFrameBuffer,
    cancel: CancellationToken,
}

impl PersistenceHandle {
    /// Queue a range already taken from the buffer. Does not wait.
    pub fn schedule(&self, range: FlushRange) -> Result<()> {
        debug!(start = range.start, end = range.end, "Scheduling flush");
        self.jobs
            .send(FlushJob { range: Some(range), reply: None })
            .map_err(|_| CaptureError::Shutdown { component: "persistence worker" })
    }

    /// Take everything pending and wait until it, and every job queued before
    /// it, has been written.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let range = self.buffer.take_flush_range();
        let (reply, done) = oneshot::channel();
        self.jobs
            .send(FlushJob { range, reply: Some(reply) })
            .map_err(|_| CaptureError::Shutdown { component: "persistence worker" })?;
        done.await.map_err(|_| CaptureError::Shutdown { component: "persistence worker" })
    }

    /// Stop the worker after the job in progress.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Result of spawning the persistence worker
pub struct PersistenceChannels {
    pub handle: PersistenceHandle,
    /// Failures of scheduled (asynchronous) flushes
    pub failures: mpsc::UnboundedReceiver<PersistenceFailure>,
    /// Resolves to lifetime totals once the worker stops
    pub join: JoinHandle<PersistenceStats>,
}

/// Single-writer persistence task.
pub struct PersistenceWorker;

impl PersistenceWorker {
    pub fn spawn<F>(store: F, buffer: SharedFrameBuffer, naming: FrameNaming) -> PersistenceChannels
    where
        F: FrameStore,
    {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = WorkerTask {
            store,
            buffer: buffer.clone(),
            naming,
            failures: failure_tx,
            stats: PersistenceStats::default(),
        };
        let join = tokio::spawn(worker.run(job_rx, cancel.clone()));

        PersistenceChannels {
            handle: PersistenceHandle { jobs: job_tx, buffer, cancel },
            failures: failure_rx,
            join,
        }
    }
}

struct WorkerTask<F> {
    store: F,
    buffer: SharedFrameBuffer,
    naming: FrameNaming,
    failures: mpsc::UnboundedSender<PersistenceFailure>,
    stats: PersistenceStats,
}

impl<F: FrameStore> WorkerTask<F> {
    async fn run(
        mut self,
        mut jobs: mpsc::UnboundedReceiver<FlushJob>,
        cancel: CancellationToken,
    ) -> PersistenceStats {
        info!(session = %self.naming.stamp(), "Persistence worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let mut report = FlushReport { range: job.range, ..Default::default() };
            if let Some(range) = job.range {
                self.write_range(range, &mut report).await;
            }

            match job.reply {
                Some(reply) => {
                    let _ = reply.send(report);
                }
                None => {
                    for failure in report.failures {
                        let _ = self.failures.send(failure);
                    }
                }
            }
        }

        info!(
            written = self.stats.frames_written,
            failed = self.stats.failed_writes,
            "Persistence worker stopped"
        );
        self.stats
    }

    async fn write_range(&mut self, range: FlushRange, report: &mut FlushReport) {
        debug!(start = range.start, end = range.end, "Writing frames");

        for index in range.indices() {
            let Some(frame) = self.buffer.frame(index) else {
                debug!(index, "Frame already released");
                continue;
            };

            match self.write_frame(&frame).await {
                Ok(()) => {
                    self.buffer.release(index);
                    self.stats.frames_written += 1;
                    report.written += 1;
                }
                Err(error) => {
                    warn!(index, %error, "Failed to save frame, dropping payload");
                    self.buffer.release(index);
                    self.stats.failed_writes += 1;
                    report.failures.push(PersistenceFailure { index, error });
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let name = self.naming.primary(frame.index);
        self.store
            .write_bytes(&name, &frame.payload.primary)
            .await
            .map_err(|e| CaptureError::persistence_failed(frame.index, self.store.location(&name), e))?;

        if let Some(auxiliary) = &frame.payload.auxiliary {
            let name = self.naming.auxiliary(frame.index);
            self.store.write_bytes(&name, &auxiliary.data).await.map_err(|e| {
                CaptureError::persistence_failed(frame.index, self.store.location(&name), e)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CameraMetadata, ExposureRecord, FramePayload, WhiteBalance};
    use chrono::TimeZone;

    fn payload(byte: u8, auxiliary: bool) -> FramePayload {
        let exposure = ExposureRecord { multiplier: 1, exposure_time_ns: 200_000_000 };
        let payload = FramePayload::new(vec![byte; 8], exposure);
        if auxiliary {
            let metadata = Arc::new(CameraMetadata {
                sensor_sensitivity: 200,
                exposure_time_ns: 200_000_000,
                focus_distance: 4.75,
                white_balance: WhiteBalance::CloudyDaylight,
            });
            payload.with_auxiliary(vec![byte; 32], metadata)
        } else {
            payload
        }
    }

    fn naming() -> FrameNaming {
        FrameNaming::with_stamp("20240102_030405")
    }

    #[test]
    fn names_are_zero_padded() {
        let started = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let naming = FrameNaming::new(started);
        assert_eq!(naming.primary(7), "20240102_030405_0007.jpg");
        assert_eq!(naming.auxiliary(12), "20240102_030405_0012.dng");
        assert_eq!(naming.primary(12345), "20240102_030405_12345.jpg");
    }

    #[tokio::test]
    async fn flush_now_writes_pending_frames_and_releases_them() {
        let buffer = SharedFrameBuffer::new(8);
        buffer.append(payload(1, true));
        buffer.append(payload(2, false));

        let store = MemoryStore::new();
        let channels = PersistenceWorker::spawn(store.clone(), buffer.clone(), naming());

        let report = channels.handle.flush_now().await.unwrap();
        assert_eq!(report.range, Some(FlushRange { start: 0, end: 2 }));
        assert_eq!(report.written, 2);
        assert!(report.failures.is_empty());

        assert_eq!(
            store.names(),
            vec!["20240102_030405_0000.dng", "20240102_030405_0000.jpg", "20240102_030405_0001.jpg"]
        );
        assert_eq!(store.get("20240102_030405_0000.dng").unwrap().len(), 32);
        assert_eq!(buffer.lock().resident(), 0);

        channels.handle.shutdown();
        let stats = channels.join.await.unwrap();
        assert_eq!(stats, PersistenceStats { frames_written: 2, failed_writes: 0 });
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_waits_for_queue() {
        let buffer = SharedFrameBuffer::new(8);
        buffer.append(payload(1, false));
        let range = buffer.take_flush_range().unwrap();

        let store = MemoryStore::new();
        let channels = PersistenceWorker::spawn(store.clone(), buffer, naming());
        channels.handle.schedule(range).unwrap();

        let report = channels.handle.flush_now().await.unwrap();
        assert_eq!(report.range, None);
        assert_eq!(report.written, 0);
        // The scheduled job ran first
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_payload_released() {
        let buffer = SharedFrameBuffer::new(8);
        for i in 0..3 {
            buffer.append(payload(i, false));
        }

        let store = MemoryStore::new();
        store.fail_on("20240102_030405_0001.jpg");
        let channels = PersistenceWorker::spawn(store.clone(), buffer.clone(), naming());

        let report = channels.handle.flush_now().await.unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(matches!(report.failures[0].error, CaptureError::Persistence { index: 1, .. }));

        // The rest of the range was still written
        assert!(store.get("20240102_030405_0002.jpg").is_some());
        assert!(buffer.frame(1).is_none());
        assert_eq!(buffer.lock().resident(), 0);
        assert_eq!(buffer.lock().exposure(1).map(|e| e.multiplier), Some(1));
    }

    #[tokio::test]
    async fn scheduled_failures_go_to_failure_channel() {
        let buffer = SharedFrameBuffer::new(1);
        buffer.append(payload(0, false));
        let outcome = buffer.append(payload(1, false));
        let range = outcome.flush.expect("capacity exceeded");

        let store = MemoryStore::new();
        store.fail_on("20240102_030405_0000.jpg");
        let mut channels = PersistenceWorker::spawn(store, buffer, naming());
        channels.handle.schedule(range).unwrap();

        let failure = channels.failures.recv().await.unwrap();
        assert_eq!(failure.index, 0);
        assert!(!failure.error.is_fatal());
    }

    #[tokio::test]
    async fn directory_store_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("session").join("frames");
        let buffer = SharedFrameBuffer::new(8);
        buffer.append(payload(9, true));

        let channels = PersistenceWorker::spawn(DirectoryStore::new(&root), buffer, naming());
        let report = channels.handle.flush_now().await.unwrap();
        assert_eq!(report.written, 1);

        let jpg = tokio::fs::read(root.join("20240102_030405_0000.jpg")).await.unwrap();
        assert_eq!(jpg, vec![9; 8]);
        assert!(root.join("20240102_030405_0000.dng").exists());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let channels =
            PersistenceWorker::spawn(MemoryStore::new(), SharedFrameBuffer::new(8), naming());
        channels.handle.shutdown();
        channels.join.await.unwrap();

        let result = channels.handle.schedule(FlushRange { start: 0, end: 1 });
        assert!(matches!(result, Err(CaptureError::Shutdown { .. })));
    }
}
