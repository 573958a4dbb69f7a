/*!
 * Scheduler: two execution lanes behind one completion barrier
 *
 * - Small files go to a bounded pool of `concurrency` worker threads fed by a
 *   bounded channel, so dispatch blocks while every worker is busy.
 * - Large files go to a single sequential lane that runs alongside the pool.
 *   Only one thread ever serves that lane, so two large files can never be
 *   in flight together.
 *
 * Results flow back over a channel and are collected by the calling thread
 * once both lanes have drained. A file's permanent failure is recorded in its
 * result; only fatal errors (invalid configuration, unreachable sink, worker
 * pool construction) abort the run. A fatal error raised by a worker trips
 * the run's abort latch: both lanes stop taking files as they do on
 * cancellation, and `run` returns that error.
 */

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, error, info, warn};

use super::cancel::{AbortLatch, CancellationToken};
use super::chunking::{ChunkPlan, ChunkSizer};
use super::classifier::SizeClassifier;
use super::probe::{MemoryProbe, SystemMemory};
use super::progress::{FileId, ProgressEvent, ProgressPublisher, ProgressState};
use super::retry::{RetryPolicy, Sleeper, ThreadSleeper};
use super::sink::DestinationSink;
use super::types::{
    FileDescriptor, Outcome, RunReport, SizeClass, TransferResult, TransferTask,
};
use super::verify::IntegrityVerifier;
use super::worker::TransferWorker;
use crate::config::TransferConfig;
use crate::error::{FreightError, Result};

/// Lifecycle of a scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Dispatching = 1,
    Draining = 2,
    Done = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::Dispatching,
            2 => SchedulerState::Draining,
            3 => SchedulerState::Done,
            _ => SchedulerState::Idle,
        }
    }
}

/// Files split into lanes, plus the run's chunk plan
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub chunk_plan: ChunkPlan,
    pub small: Vec<FileDescriptor>,
    pub large: Vec<FileDescriptor>,
    pub bytes_total: u64,
}

impl RunPlan {
    pub fn files_total(&self) -> usize {
        self.small.len() + self.large.len()
    }
}

pub struct Scheduler {
    config: TransferConfig,
    sink: Arc<dyn DestinationSink>,
    sleeper: Arc<dyn Sleeper>,
    memory: Arc<dyn MemoryProbe>,
    publisher: ProgressPublisher,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl Scheduler {
    pub fn new(config: TransferConfig, sink: Arc<dyn DestinationSink>) -> Self {
        Self {
            config,
            sink,
            sleeper: Arc::new(ThreadSleeper),
            memory: Arc::new(SystemMemory),
            publisher: ProgressPublisher::noop(),
            cancel: CancellationToken::new(),
            state: AtomicU8::new(SchedulerState::Idle as u8),
        }
    }

    /// Replace the backoff delay provider
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the memory probe used for chunk sizing
    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_publisher(mut self, publisher: ProgressPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this scheduler's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(from = ?self.state(), to = ?state, "Scheduler state change");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Classify files and size chunks without transferring anything
    pub fn plan(&self, mut files: Vec<FileDescriptor>) -> RunPlan {
        if self.config.sort_by_size {
            files.sort_by_key(FileDescriptor::size);
        }
        let bytes_total = files.iter().map(FileDescriptor::size).sum();
        let chunk_plan = ChunkSizer::from_config(&self.config).plan(self.memory.as_ref());
        let (small, large) =
            SizeClassifier::new(self.config.large_threshold_bytes).classify(files);

        RunPlan {
            chunk_plan,
            small,
            large,
            bytes_total,
        }
    }

    /// Transfer every file and return one result per file
    ///
    /// Errors only for fatal conditions; per-file failures are in the report.
    pub fn run(&self, files: Vec<FileDescriptor>) -> Result<RunReport> {
        self.config.validate()?;
        self.sink.probe().map_err(|e| match e {
            FreightError::SinkUnavailable(_) => e,
            other => FreightError::SinkUnavailable(other.to_string()),
        })?;

        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                match SchedulerState::from_u8(state) {
                    SchedulerState::Idle | SchedulerState::Done => {
                        Some(SchedulerState::Dispatching as u8)
                    }
                    _ => None,
                }
            })
            .map_err(|_| FreightError::Config("scheduler is already running".to_string()))?;
        debug!(state = ?SchedulerState::Dispatching, "Scheduler state change");
        let started = Instant::now();

        let plan = self.plan(files);
        let files_total = plan.files_total();
        info!(
            sink = %self.sink.describe(),
            files = files_total,
            small = plan.small.len(),
            large = plan.large.len(),
            bytes = plan.bytes_total,
            chunk_size = plan.chunk_plan.chunk_size,
            chunk_source = %plan.chunk_plan.source,
            concurrency = self.config.concurrency,
            "Run started"
        );
        self.publisher.publish(ProgressEvent::RunStart {
            files_total: files_total as u64,
            bytes_total: plan.bytes_total,
            chunk_size: plan.chunk_plan.chunk_size,
            timestamp: ProgressEvent::current_timestamp(),
        });

        let progress = ProgressState::new(plan.bytes_total);
        let policy = RetryPolicy::from_config(&self.config);
        let run_cancel = self.cancel.child();
        let abort = AbortLatch::new(run_cancel.clone());
        let worker = TransferWorker {
            sink: self.sink.as_ref(),
            policy: &policy,
            verifier: IntegrityVerifier::from_config(&self.config),
            sleeper: self.sleeper.as_ref(),
            progress: &progress,
            publisher: &self.publisher,
            cancel: &run_cancel,
            abort: &abort,
            mmap_threshold: self.config.mmap_threshold_bytes,
        };

        let (result_tx, result_rx) = unbounded::<TransferResult>();
        let chunk_plan = plan.chunk_plan;
        let dispatched = self.dispatch(plan, worker, &result_tx);
        drop(result_tx);

        let results: Vec<TransferResult> = result_rx.try_iter().collect();
        self.set_state(SchedulerState::Done);

        if let Err(err) = dispatched.and_then(|()| abort.take().map_or(Ok(()), Err)) {
            error!(
                error = %err,
                finished = results.iter().filter(|r| !r.outcome.is_cancelled()).count(),
                files = files_total,
                "Run aborted"
            );
            return Err(err);
        }
        debug_assert_eq!(results.len(), files_total);

        let report = RunReport {
            results,
            cancelled: self.cancel.is_cancelled(),
            chunk_plan,
            elapsed: started.elapsed(),
            bytes_total: progress.bytes_total(),
        };

        let summary = report.summary();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            bytes = summary.bytes_transferred,
            retries = summary.retries,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run complete"
        );
        self.publisher.publish(ProgressEvent::RunComplete {
            files_succeeded: summary.succeeded as u64,
            files_failed: summary.failed as u64,
            files_cancelled: summary.cancelled as u64,
            total_bytes: summary.bytes_transferred,
            duration_ms: report.elapsed.as_millis() as u64,
            cancelled: report.cancelled,
            timestamp: ProgressEvent::current_timestamp(),
        });

        Ok(report)
    }

    /// Start both lanes, feed them, and wait for them to drain
    fn dispatch(
        &self,
        plan: RunPlan,
        worker: TransferWorker<'_>,
        results: &Sender<TransferResult>,
    ) -> Result<()> {
        let RunPlan {
            chunk_plan,
            small,
            large,
            ..
        } = plan;
        let concurrency = self.config.concurrency;

        thread::scope(|scope| -> Result<()> {
            let (task_tx, task_rx) = bounded::<TransferTask>(concurrency);

            for index in 0..concurrency {
                let tasks = task_rx.clone();
                let results = results.clone();
                thread::Builder::new()
                    .name(format!("freight-small-{}", index))
                    .spawn_scoped(scope, move || {
                        for task in tasks.iter() {
                            // Receiver gone only if the run is being torn down
                            let _ = results.send(worker.run(task));
                        }
                    })
                    .map_err(|e| {
                        FreightError::WorkerPool(format!("cannot spawn small-file worker: {}", e))
                    })?;
            }
            drop(task_rx);

            let lane_results = results.clone();
            let cancel = worker.cancel.clone();
            let publisher = self.publisher.clone();
            thread::Builder::new()
                .name("freight-large".to_string())
                .spawn_scoped(scope, move || {
                    for file in large {
                        let result = if cancel.is_cancelled() {
                            publisher.cancel_transfer(FileId::new(file.dest_key()));
                            TransferResult::cancelled(&file, SizeClass::Large)
                        } else {
                            worker.run(TransferTask::new(file, chunk_plan, SizeClass::Large))
                        };
                        let _ = lane_results.send(result);
                    }
                })
                .map_err(|e| {
                    FreightError::WorkerPool(format!("cannot spawn large-file lane: {}", e))
                })?;

            for file in small {
                if worker.cancel.is_cancelled() {
                    self.publisher.cancel_transfer(FileId::new(file.dest_key()));
                    let _ = results.send(TransferResult::cancelled(&file, SizeClass::Small));
                    continue;
                }
                let task = TransferTask::new(file, chunk_plan, SizeClass::Small);
                if let Err(returned) = task_tx.send(task) {
                    // Every worker has exited; nothing can run this file
                    let task = returned.into_inner();
                    warn!(file = %task.file.dest_key(), "No small-file worker left");
                    let err = FreightError::WorkerPool("small-file workers exited".to_string());
                    let _ = results.send(TransferResult {
                        outcome: Outcome::from_error(&err),
                        ..TransferResult::cancelled(&task.file, SizeClass::Small)
                    });
                }
            }
            drop(task_tx);

            self.set_state(SchedulerState::Draining);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::FixedMemory;
    use crate::core::retry::RecordingSleeper;
    use crate::core::sink::MemorySink;
    use crate::logging::init_test_logging;

    fn memory_files(sizes: &[usize]) -> Vec<FileDescriptor> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let key = format!("file-{}.bin", i);
                FileDescriptor::in_memory(&key, vec![i as u8; size], key.clone())
            })
            .collect()
    }

    fn scheduler(config: TransferConfig, sink: MemorySink) -> Scheduler {
        Scheduler::new(config, Arc::new(sink))
            .with_sleeper(Arc::new(RecordingSleeper::new()))
            .with_memory_probe(Arc::new(FixedMemory::available(256 * 1024 * 1024)))
    }

    #[test]
    fn test_plan_sorts_and_classifies() {
        let config = TransferConfig {
            large_threshold_bytes: 100,
            ..Default::default()
        };
        let plan = scheduler(config, MemorySink::new()).plan(memory_files(&[500, 10, 100, 101, 1]));

        let small: Vec<u64> = plan.small.iter().map(FileDescriptor::size).collect();
        let large: Vec<u64> = plan.large.iter().map(FileDescriptor::size).collect();
        assert_eq!(small, vec![1, 10, 100]);
        assert_eq!(large, vec![101, 500]);
        assert_eq!(plan.bytes_total, 712);
        assert_eq!(plan.files_total(), 5);
    }

    #[test]
    fn test_run_transfers_everything() {
        init_test_logging();
        let sink = MemorySink::new();
        let config = TransferConfig {
            concurrency: 2,
            large_threshold_bytes: 1000,
            chunk_size: Some(64 * 1024),
            ..Default::default()
        };
        let scheduler = scheduler(config, sink.clone());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let report = scheduler.run(memory_files(&[10, 2000, 0, 30, 5000])).unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|r| r.outcome == Outcome::Success));
        assert!(!report.cancelled);
        assert_eq!(report.bytes_total, 7040);
        assert_eq!(sink.len(), 5);
        assert_eq!(sink.get("file-4.bin").unwrap(), vec![4u8; 5000]);

        let large = report
            .results
            .iter()
            .filter(|r| r.size_class == SizeClass::Large)
            .count();
        assert_eq!(large, 2);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = TransferConfig {
            concurrency: 0,
            ..Default::default()
        };
        let err = scheduler(config, MemorySink::new())
            .run(memory_files(&[1]))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cancel_before_run_cancels_every_file() {
        let sink = MemorySink::new();
        let scheduler = scheduler(TransferConfig::default(), sink.clone());
        scheduler.cancellation_token().cancel();

        let report = scheduler.run(memory_files(&[1, 2, 3])).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|r| r.outcome.is_cancelled()));
        assert!(sink.is_empty());
        assert_eq!(report.exit_code(), crate::error::EXIT_PARTIAL);
    }

    #[test]
    fn test_empty_run() {
        let report = scheduler(TransferConfig::default(), MemorySink::new())
            .run(Vec::new())
            .unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.exit_code(), crate::error::EXIT_SUCCESS);
    }
}
