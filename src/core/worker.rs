/*!
 * Transfer worker: moves one file from its source to the sink
 *
 * Each attempt reads the source chunk by chunk, writes every chunk to a fresh
 * sink entry before reading the next, hashes the same chunks for
 * verification and reports bytes after every chunk. The entry is committed
 * only once the sink's receipt has been verified. The retry policy wraps
 * whole attempts: a retry restarts at byte 0 with a new entry, and the bytes
 * a failed or panicked attempt reported are taken back from the run's
 * progress. A fatal error trips the run's abort latch.
 */

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::cancel::{AbortLatch, CancellationToken};
use super::checksum::StreamingHasher;
use super::progress::{FileId, ProgressEvent, ProgressPublisher, ProgressState};
use super::retry::{AttemptReport, RetryPolicy, Sleeper};
use super::sink::{DestinationSink, SinkEntry};
use super::source::SourceReader;
use super::types::{FileDescriptor, Outcome, TransferResult, TransferTask};
use super::verify::{IntegrityVerifier, Verified};
use crate::error::{FreightError, Result};

/// Everything a worker borrows from the run that owns it
#[derive(Clone, Copy)]
pub struct TransferWorker<'a> {
    pub sink: &'a dyn DestinationSink,
    pub policy: &'a RetryPolicy,
    pub verifier: IntegrityVerifier,
    pub sleeper: &'a dyn Sleeper,
    pub progress: &'a ProgressState,
    pub publisher: &'a ProgressPublisher,
    /// Run-scoped token: the caller's cancellation or a tripped abort latch
    pub cancel: &'a CancellationToken,
    pub abort: &'a AbortLatch,
    /// Files strictly larger than this are memory mapped
    pub mmap_threshold: u64,
}

impl<'a> TransferWorker<'a> {
    /// Transfer one file and produce its result
    ///
    /// Never panics: a panic inside the transfer becomes a permanent
    /// failure of this file.
    pub fn run(&self, task: TransferTask) -> TransferResult {
        let file = task.file.clone();
        let size_class = task.size_class;
        let started = Instant::now();
        // Bytes reported by the attempt in progress and not yet settled
        let in_flight = Cell::new(0u64);

        match panic::catch_unwind(AssertUnwindSafe(|| self.run_task(task, &in_flight))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(file = %file.dest_key(), panic = %message, "Worker panicked");
                self.progress.rewind_bytes(in_flight.take());
                let err = FreightError::WorkerPanic(message);
                self.publisher
                    .fail_transfer(FileId::new(file.dest_key()), err.to_string());
                self.progress.file_done();
                TransferResult {
                    dest_key: file.dest_key().to_string(),
                    source: file.source().display_name(),
                    size_class,
                    bytes_transferred: 0,
                    checksum: None,
                    elapsed: started.elapsed(),
                    retry_count: 0,
                    attempts: 0,
                    outcome: Outcome::from_error(&err),
                }
            }
        }
    }

    fn run_task(&self, mut task: TransferTask, in_flight: &Cell<u64>) -> TransferResult {
        let started = Instant::now();
        let key = task.file.dest_key().to_string();
        let file_id = self.publisher.start_transfer(
            &key,
            task.file.source().display_name(),
            task.size_class,
            task.file.size(),
        );
        debug!(
            file = %key,
            size = task.file.size(),
            class = %task.size_class,
            chunks = task.plan.total_chunks(task.file.size()),
            "Transfer started"
        );

        let outcome = self.policy.execute(
            self.sleeper,
            Some(self.cancel),
            |report| self.publish_attempt(&file_id, report),
            |attempt| {
                task.attempt = attempt;
                self.attempt(&task, &file_id, in_flight)
            },
        );

        let elapsed = started.elapsed();
        self.progress.file_done();

        let (bytes_transferred, checksum, result_outcome) = match outcome.result {
            Ok(verified) => {
                info!(
                    file = %key,
                    bytes = verified.bytes,
                    attempts = outcome.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Transfer complete"
                );
                self.publisher.complete_transfer(
                    file_id,
                    verified.bytes,
                    elapsed.as_millis() as u64,
                    verified.digest.clone(),
                    outcome.retry_count,
                );
                (verified.bytes, verified.digest, Outcome::Success)
            }
            Err(FreightError::Cancelled) => {
                info!(file = %key, "Transfer cancelled");
                self.publisher.cancel_transfer(file_id);
                (0, None, Outcome::Cancelled)
            }
            Err(err) => {
                warn!(
                    file = %key,
                    category = %err.category(),
                    attempts = outcome.attempts,
                    error = %err,
                    "Transfer failed"
                );
                self.publisher.fail_transfer(file_id, err.to_string());
                let outcome = Outcome::from_error(&err);
                if err.is_fatal() {
                    error!(file = %key, error = %err, "Fatal error, aborting run");
                    self.abort.trip(err);
                }
                (0, None, outcome)
            }
        };

        TransferResult {
            dest_key: key,
            source: task.file.source().display_name(),
            size_class: task.size_class,
            bytes_transferred,
            checksum,
            elapsed,
            retry_count: outcome.retry_count,
            attempts: outcome.attempts,
            outcome: result_outcome,
        }
    }

    /// One attempt from byte 0
    fn attempt(&self, task: &TransferTask, file_id: &FileId, moved: &Cell<u64>) -> Result<Verified> {
        let file = &task.file;
        let mut reader = SourceReader::open(file, task.plan.chunk_size, self.mmap_threshold)?;
        let algorithm = self.verifier.digest_algorithm();
        let mut entry = self.sink.open_entry(file, algorithm)?;
        let mut hasher = algorithm.map(StreamingHasher::new);
        moved.set(0);

        debug!(
            file = %file.dest_key(),
            attempt = task.attempt,
            strategy = ?reader.strategy(),
            "Attempt started"
        );

        let streamed = self.stream(
            &mut reader,
            entry.as_mut(),
            hasher.as_mut(),
            file,
            file_id,
            moved,
        );
        if let Err(err) = streamed {
            entry.abort();
            self.progress.rewind_bytes(moved.take());
            return Err(err);
        }

        let expected_digest = hasher.map(StreamingHasher::finalize_hex);
        let verified = entry.finish().and_then(|receipt| {
            self.verifier
                .verify(&receipt, file.size(), expected_digest.as_deref())
        });
        let committed = match verified {
            Ok(verified) => entry.commit().map(|()| verified),
            Err(err) => {
                entry.abort();
                Err(err)
            }
        };

        let settled = moved.take();
        if committed.is_err() {
            self.progress.rewind_bytes(settled);
        }
        committed
    }

    fn stream(
        &self,
        reader: &mut SourceReader,
        entry: &mut dyn SinkEntry,
        mut hasher: Option<&mut StreamingHasher>,
        file: &FileDescriptor,
        file_id: &FileId,
        moved: &Cell<u64>,
    ) -> Result<()> {
        let mut offset = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FreightError::Cancelled);
            }
            let Some(chunk) = reader.next_chunk()? else {
                break;
            };

            entry.write_chunk(offset, chunk)?;
            if let Some(hasher) = hasher.as_deref_mut() {
                hasher.update(chunk);
            }

            let len = chunk.len() as u64;
            offset += len;
            moved.set(moved.get() + len);
            self.progress.add_bytes(len);
            self.publisher.update_progress(
                file_id,
                offset,
                file.size(),
                self.progress.rate_bytes_per_sec(),
            );
        }
        Ok(())
    }

    fn publish_attempt(&self, file_id: &FileId, report: &AttemptReport) {
        self.publisher.publish(ProgressEvent::Attempt {
            file_id: file_id.clone(),
            attempt: report.attempt,
            succeeded: report.succeeded(),
            error: report.error.clone(),
            next_delay_ms: report.next_delay().map(|d| d.as_millis() as u64),
            timestamp: ProgressEvent::current_timestamp(),
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumAlgorithm, VerifyMode};
    use crate::core::chunking::{ChunkPlan, ChunkSizeSource};
    use crate::core::checksum::digest_bytes;
    use crate::core::retry::RecordingSleeper;
    use crate::core::sink::{EntryReceipt, MemorySink};
    use crate::core::types::SizeClass;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Memory sink whose first `corrupt` entries report a wrong digest
    struct CorruptingSink {
        inner: MemorySink,
        corrupt: u32,
        opened: std::sync::Arc<AtomicU32>,
    }

    struct CorruptingEntry {
        inner: Box<dyn SinkEntry>,
        corrupt: bool,
    }

    impl DestinationSink for CorruptingSink {
        fn describe(&self) -> String {
            "corrupting".to_string()
        }

        fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn open_entry(
            &self,
            file: &FileDescriptor,
            digest: Option<ChecksumAlgorithm>,
        ) -> Result<Box<dyn SinkEntry>> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CorruptingEntry {
                inner: self.inner.open_entry(file, digest)?,
                corrupt: n < self.corrupt,
            }))
        }
    }

    impl SinkEntry for CorruptingEntry {
        fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            self.inner.write_chunk(offset, data)
        }

        fn finish(&mut self) -> Result<EntryReceipt> {
            let mut receipt = self.inner.finish()?;
            if self.corrupt {
                receipt.digest = Some("0".repeat(64));
            }
            Ok(receipt)
        }

        fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit()
        }

        fn abort(self: Box<Self>) {
            self.inner.abort();
        }
    }

    struct PanickingSink;

    /// Accepts the first chunk of every entry, then panics
    struct MidStreamPanicSink {
        inner: MemorySink,
    }

    struct MidStreamPanicEntry {
        inner: Box<dyn SinkEntry>,
    }

    impl DestinationSink for MidStreamPanicSink {
        fn describe(&self) -> String {
            "mid-stream-panic".to_string()
        }

        fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn open_entry(
            &self,
            file: &FileDescriptor,
            digest: Option<ChecksumAlgorithm>,
        ) -> Result<Box<dyn SinkEntry>> {
            Ok(Box::new(MidStreamPanicEntry {
                inner: self.inner.open_entry(file, digest)?,
            }))
        }
    }

    impl SinkEntry for MidStreamPanicEntry {
        fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            if offset > 0 {
                panic!("connection dropped at offset {}", offset);
            }
            self.inner.write_chunk(offset, data)
        }

        fn finish(&mut self) -> Result<EntryReceipt> {
            self.inner.finish()
        }

        fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit()
        }

        fn abort(self: Box<Self>) {
            self.inner.abort();
        }
    }

    struct GoneSink;

    impl DestinationSink for GoneSink {
        fn describe(&self) -> String {
            "gone".to_string()
        }

        fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn open_entry(
            &self,
            _file: &FileDescriptor,
            _digest: Option<ChecksumAlgorithm>,
        ) -> Result<Box<dyn SinkEntry>> {
            Err(FreightError::SinkUnavailable("bucket deleted".to_string()))
        }
    }

    impl DestinationSink for PanickingSink {
        fn describe(&self) -> String {
            "panicking".to_string()
        }

        fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn open_entry(
            &self,
            _file: &FileDescriptor,
            _digest: Option<ChecksumAlgorithm>,
        ) -> Result<Box<dyn SinkEntry>> {
            panic!("sink exploded")
        }
    }

    struct Harness {
        policy: RetryPolicy,
        sleeper: RecordingSleeper,
        progress: ProgressState,
        publisher: ProgressPublisher,
        cancel: CancellationToken,
        abort: AbortLatch,
    }

    impl Harness {
        fn new(max_attempts: u32) -> (Self, crate::core::progress::ProgressSubscriber) {
            let (publisher, subscriber) = ProgressPublisher::unbounded();
            let cancel = CancellationToken::new();
            (
                Self {
                    policy: RetryPolicy::new(max_attempts, Duration::from_millis(10)),
                    sleeper: RecordingSleeper::new(),
                    progress: ProgressState::new(0),
                    publisher,
                    abort: AbortLatch::new(cancel.clone()),
                    cancel,
                },
                subscriber,
            )
        }

        fn worker<'a>(&'a self, sink: &'a dyn DestinationSink) -> TransferWorker<'a> {
            TransferWorker {
                sink,
                policy: &self.policy,
                verifier: IntegrityVerifier::new(VerifyMode::Checksum, ChecksumAlgorithm::Sha256),
                sleeper: &self.sleeper,
                progress: &self.progress,
                publisher: &self.publisher,
                cancel: &self.cancel,
                abort: &self.abort,
                mmap_threshold: u64::MAX,
            }
        }
    }

    fn task(data: &[u8], key: &str, chunk: u64) -> TransferTask {
        TransferTask::new(
            FileDescriptor::in_memory(key, data.to_vec(), key),
            ChunkPlan::new(chunk, ChunkSizeSource::Override),
            SizeClass::Small,
        )
    }

    #[test]
    fn test_successful_transfer_reports_every_chunk() {
        let (harness, subscriber) = Harness::new(3);
        let sink = MemorySink::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();

        let result = harness.worker(&sink).run(task(&data, "f.bin", 4096));

        assert!(result.outcome.is_success());
        assert_eq!(result.bytes_transferred, 10_000);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            result.checksum.as_deref(),
            Some(digest_bytes(&data, ChecksumAlgorithm::Sha256).as_str())
        );
        assert_eq!(sink.get("f.bin").unwrap(), data);
        assert_eq!(harness.progress.bytes_done(), 10_000);
        assert_eq!(harness.progress.files_done(), 1);

        let progress: Vec<u64> = subscriber
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::TransferProgress { bytes_done, .. } => Some(bytes_done),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_mismatch_then_match_retries_once() {
        let (harness, subscriber) = Harness::new(3);
        let sink = CorruptingSink {
            inner: MemorySink::new(),
            corrupt: 1,
            opened: Default::default(),
        };

        let result = harness.worker(&sink).run(task(b"retry me", "r.txt", 4));

        assert!(result.outcome.is_success());
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.attempts, 2);
        assert_eq!(harness.sleeper.delays(), vec![Duration::from_millis(10)]);
        // The failed attempt's bytes were taken back
        assert_eq!(harness.progress.bytes_done(), 8);

        let attempts: Vec<bool> = subscriber
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Attempt { succeeded, .. } => Some(succeeded),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![false, true]);
    }

    #[test]
    fn test_retry_result_matches_first_try() {
        let (harness, _subscriber) = Harness::new(3);
        let clean = MemorySink::new();
        let first = harness.worker(&clean).run(task(b"same bytes", "s", 3));

        let flaky = CorruptingSink {
            inner: MemorySink::new(),
            corrupt: 2,
            opened: Default::default(),
        };
        let retried = harness.worker(&flaky).run(task(b"same bytes", "s", 3));

        assert_eq!(retried.retry_count, 2);
        assert_eq!(first.checksum, retried.checksum);
        assert_eq!(first.bytes_transferred, retried.bytes_transferred);
    }

    #[test]
    fn test_persistent_mismatch_exhausts_retries() {
        let (harness, _subscriber) = Harness::new(4);
        let sink = CorruptingSink {
            inner: MemorySink::new(),
            corrupt: u32::MAX,
            opened: Default::default(),
        };

        let result = harness.worker(&sink).run(task(b"never right", "n", 4));

        assert_eq!(result.retry_count, 4);
        assert!(matches!(
            result.outcome,
            Outcome::PermanentFailure {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));
        assert_eq!(harness.progress.bytes_done(), 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (harness, _subscriber) = Harness::new(3);
        harness.cancel.cancel();
        let sink = MemorySink::new();

        let result = harness.worker(&sink).run(task(b"abc", "c", 1));
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(result.attempts, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_panic_becomes_failure() {
        let (harness, _subscriber) = Harness::new(3);
        let result = harness.worker(&PanickingSink).run(task(b"abc", "p", 1));
        assert!(matches!(
            result.outcome,
            Outcome::PermanentFailure {
                kind: FailureKind::Panic,
                ..
            }
        ));
    }

    #[test]
    fn test_panic_mid_stream_rewinds_progress() {
        let (harness, _subscriber) = Harness::new(3);
        let sink = MidStreamPanicSink {
            inner: MemorySink::new(),
        };

        let result = harness.worker(&sink).run(task(b"twelve bytes", "m", 4));

        assert!(matches!(
            result.outcome,
            Outcome::PermanentFailure {
                kind: FailureKind::Panic,
                ..
            }
        ));
        assert_eq!(harness.progress.bytes_done(), 0);
        assert_eq!(harness.progress.files_done(), 1);
        assert!(sink.inner.is_empty());
    }

    #[test]
    fn test_fatal_error_trips_abort_latch() {
        let (harness, _subscriber) = Harness::new(5);

        let result = harness.worker(&GoneSink).run(task(b"abc", "g", 1));

        assert_eq!(result.attempts, 1);
        assert!(harness.sleeper.delays().is_empty());
        assert!(harness.cancel.is_cancelled());
        assert!(matches!(
            harness.abort.take(),
            Some(FreightError::SinkUnavailable(_))
        ));
    }

    #[test]
    fn test_unverified_entry_is_never_committed() {
        let (harness, _subscriber) = Harness::new(2);
        let sink = CorruptingSink {
            inner: MemorySink::new(),
            corrupt: u32::MAX,
            opened: Default::default(),
        };

        let result = harness.worker(&sink).run(task(b"bad copy", "u", 4));

        assert!(result.outcome.is_failure());
        assert!(sink.inner.is_empty());
    }
}
