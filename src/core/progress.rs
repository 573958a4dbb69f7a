/*!
 * Progress tracking for a transfer run
 *
 * Two pieces:
 * - `ProgressState`: run-wide counters, updated with atomic adds only
 * - `ProgressPublisher` / `ProgressSubscriber`: an event stream for UIs and
 *   logs. Publishing never blocks; a slow or absent subscriber only loses
 *   events.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use super::types::SizeClass;

/// Run-wide progress counters
///
/// Owned by one run and shared with its workers through an `Arc`. Workers
/// only add to and subtract from the counters; nobody reads another
/// worker's partial state.
#[derive(Debug)]
pub struct ProgressState {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    files_done: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of [`ProgressState`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub files_done: u64,
    pub rate_bytes_per_sec: f64,
}

impl ProgressState {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(bytes_total),
            files_done: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record `bytes` moved; returns the new run total
    pub fn add_bytes(&self, bytes: u64) -> u64 {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Take back bytes reported by an attempt that failed
    pub fn rewind_bytes(&self, bytes: u64) {
        self.bytes_done.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::Relaxed)
    }

    pub fn rate_bytes_per_sec(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_done() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_done: self.bytes_done(),
            bytes_total: self.bytes_total(),
            files_done: self.files_done(),
            rate_bytes_per_sec: self.rate_bytes_per_sec(),
        }
    }
}

/// Identifies one file in the event stream (its destination key)
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FileId(String);

impl FileId {
    pub fn new(dest_key: &str) -> Self {
        FileId(dest_key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress event types
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Run planned, dispatch about to begin
    RunStart {
        files_total: u64,
        bytes_total: u64,
        chunk_size: u64,
        timestamp: u64,
    },

    /// Worker picked up a file
    TransferStart {
        file_id: FileId,
        source: String,
        size_class: SizeClass,
        total_bytes: u64,
        timestamp: u64,
    },

    /// A chunk reached the sink
    TransferProgress {
        file_id: FileId,
        bytes_done: u64,
        bytes_total: u64,
        /// Run-wide rate in bytes per second
        rate: f64,
        timestamp: u64,
    },

    /// One retry-policy attempt finished
    Attempt {
        file_id: FileId,
        attempt: u32,
        succeeded: bool,
        error: Option<String>,
        next_delay_ms: Option<u64>,
        timestamp: u64,
    },

    /// Transfer completed and verified
    TransferComplete {
        file_id: FileId,
        total_bytes: u64,
        duration_ms: u64,
        checksum: Option<String>,
        retry_count: u32,
        timestamp: u64,
    },

    /// Transfer failed permanently
    TransferFailed {
        file_id: FileId,
        error: String,
        timestamp: u64,
    },

    /// Transfer stopped or never started because the run was cancelled
    TransferCancelled { file_id: FileId, timestamp: u64 },

    /// Every file has a result
    RunComplete {
        files_succeeded: u64,
        files_failed: u64,
        files_cancelled: u64,
        total_bytes: u64,
        duration_ms: u64,
        cancelled: bool,
        timestamp: u64,
    },
}

impl ProgressEvent {
    pub(crate) fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// File the event belongs to, if any
    pub fn file_id(&self) -> Option<&FileId> {
        match self {
            ProgressEvent::TransferStart { file_id, .. }
            | ProgressEvent::TransferProgress { file_id, .. }
            | ProgressEvent::Attempt { file_id, .. }
            | ProgressEvent::TransferComplete { file_id, .. }
            | ProgressEvent::TransferFailed { file_id, .. }
            | ProgressEvent::TransferCancelled { file_id, .. } => Some(file_id),
            ProgressEvent::RunStart { .. } | ProgressEvent::RunComplete { .. } => None,
        }
    }
}

/// Progress publisher - sends events to subscribers
#[derive(Clone)]
pub struct ProgressPublisher {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressPublisher {
    /// Create a new publisher with bounded channel
    ///
    /// Events are dropped while the buffer is full.
    pub fn new(buffer_size: usize) -> (Self, ProgressSubscriber) {
        let (tx, rx) = bounded(buffer_size);
        (
            ProgressPublisher { sender: Some(tx) },
            ProgressSubscriber { receiver: rx },
        )
    }

    /// Create a new publisher with unbounded channel
    pub fn unbounded() -> (Self, ProgressSubscriber) {
        let (tx, rx) = unbounded();
        (
            ProgressPublisher { sender: Some(tx) },
            ProgressSubscriber { receiver: rx },
        )
    }

    /// Create a no-op publisher (for when progress tracking is disabled)
    pub fn noop() -> Self {
        ProgressPublisher { sender: None }
    }

    /// Publish an event without waiting
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.sender {
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Progress buffer full, event dropped");
                }
            }
        }
    }

    pub fn start_transfer(
        &self,
        dest_key: &str,
        source: String,
        size_class: SizeClass,
        total_bytes: u64,
    ) -> FileId {
        let file_id = FileId::new(dest_key);
        self.publish(ProgressEvent::TransferStart {
            file_id: file_id.clone(),
            source,
            size_class,
            total_bytes,
            timestamp: ProgressEvent::current_timestamp(),
        });
        file_id
    }

    pub fn update_progress(&self, file_id: &FileId, bytes_done: u64, bytes_total: u64, rate: f64) {
        self.publish(ProgressEvent::TransferProgress {
            file_id: file_id.clone(),
            bytes_done,
            bytes_total,
            rate,
            timestamp: ProgressEvent::current_timestamp(),
        });
    }

    pub fn complete_transfer(
        &self,
        file_id: FileId,
        total_bytes: u64,
        duration_ms: u64,
        checksum: Option<String>,
        retry_count: u32,
    ) {
        self.publish(ProgressEvent::TransferComplete {
            file_id,
            total_bytes,
            duration_ms,
            checksum,
            retry_count,
            timestamp: ProgressEvent::current_timestamp(),
        });
    }

    pub fn fail_transfer(&self, file_id: FileId, error: String) {
        self.publish(ProgressEvent::TransferFailed {
            file_id,
            error,
            timestamp: ProgressEvent::current_timestamp(),
        });
    }

    pub fn cancel_transfer(&self, file_id: FileId) {
        self.publish(ProgressEvent::TransferCancelled {
            file_id,
            timestamp: ProgressEvent::current_timestamp(),
        });
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::noop()
    }
}

/// Progress subscriber - receives events
pub struct ProgressSubscriber {
    receiver: Receiver<ProgressEvent>,
}

impl ProgressSubscriber {
    /// Get the receiver for consuming events
    pub fn receiver(&self) -> &Receiver<ProgressEvent> {
        &self.receiver
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive an event (blocking)
    pub fn recv(&self) -> Option<ProgressEvent> {
        self.receiver.recv().ok()
    }

    /// Iterate until every publisher is dropped
    pub fn iter(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        self.receiver.iter()
    }

    /// Events already queued
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Progress state shared across a run's workers
pub type SharedProgress = Arc<ProgressState>;
