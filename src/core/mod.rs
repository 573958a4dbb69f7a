/*!
 * Core transfer engine
 *
 * Discovery feeds a `Scheduler`, which sizes chunks against available
 * memory, splits the batch by size and runs it through `TransferWorker`s:
 * a bounded pool for small files, a single lane for large ones.
 */

pub mod cancel;
pub mod checksum;
pub mod chunking;
pub mod classifier;
pub mod discovery;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;
pub mod verify;
pub mod worker;

pub use cancel::{AbortLatch, CancellationToken};
pub use chunking::{ChunkPlan, ChunkSizeSource, ChunkSizer};
pub use classifier::{classify, SizeClassifier};
pub use discovery::discover;
pub use probe::{FixedMemory, MemoryProbe, MemorySnapshot, SystemMemory};
pub use progress::{ProgressEvent, ProgressPublisher, ProgressSubscriber};
pub use retry::{RetryPolicy, RetryState, Sleeper, ThreadSleeper};
pub use scheduler::{RunPlan, Scheduler, SchedulerState};
pub use sink::{BundleSink, DestinationSink, DirectorySink, MemorySink};
pub use types::{
    FileDescriptor, Outcome, RunReport, RunSummary, SizeClass, SourceLocation, TransferResult,
    TransferTask,
};
pub use verify::IntegrityVerifier;
pub use worker::TransferWorker;
