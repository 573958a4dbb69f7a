/*!
 * Data model shared by the transfer engine
 */

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::chunking::ChunkPlan;
use crate::error::{FailureKind, FreightError, Result, EXIT_PARTIAL, EXIT_SUCCESS};

/// Where the bytes of a transferable unit come from
#[derive(Clone)]
pub enum SourceLocation {
    /// A file on the local filesystem
    Path(PathBuf),

    /// A named in-memory buffer
    Memory { name: String, data: Arc<[u8]> },
}

impl SourceLocation {
    /// Human-readable identifier for logs and reports
    pub fn display_name(&self) -> String {
        match self {
            SourceLocation::Path(path) => path.display().to_string(),
            SourceLocation::Memory { name, .. } => format!("memory:{}", name),
        }
    }
}

impl fmt::Debug for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Path(path) => f.debug_tuple("Path").field(path).finish(),
            SourceLocation::Memory { name, data } => f
                .debug_struct("Memory")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// One transferable unit. Immutable once created.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    source: SourceLocation,
    size: u64,
    dest_key: String,
}

impl FileDescriptor {
    pub fn new(source: SourceLocation, size: u64, dest_key: impl Into<String>) -> Self {
        Self {
            source,
            size,
            dest_key: dest_key.into(),
        }
    }

    /// Describe a file on disk, reading its current size
    pub fn from_path(path: impl AsRef<Path>, dest_key: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FreightError::SourceNotFound(path.to_path_buf())
            } else {
                FreightError::Io(e)
            }
        })?;
        Ok(Self::new(
            SourceLocation::Path(path.to_path_buf()),
            metadata.len(),
            dest_key,
        ))
    }

    /// Describe an in-memory buffer; the size is the buffer length
    pub fn in_memory(
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
        dest_key: impl Into<String>,
    ) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(
            SourceLocation::Memory {
                name: name.into(),
                data,
            },
            size,
            dest_key,
        )
    }

    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dest_key(&self) -> &str {
        &self.dest_key
    }
}

/// Scheduling category, recomputed per run from the configured threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// May share the parallel pool
    Small,
    /// Runs in the sequential lane, one at a time
    Large,
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeClass::Small => write!(f, "small"),
            SizeClass::Large => write!(f, "large"),
        }
    }
}

/// A dispatched file. Only the executing worker mutates it.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub file: FileDescriptor,
    pub plan: ChunkPlan,
    pub size_class: SizeClass,
    pub attempt: u32,
}

impl TransferTask {
    pub fn new(file: FileDescriptor, plan: ChunkPlan, size_class: SizeClass) -> Self {
        Self {
            file,
            plan,
            size_class,
            attempt: 0,
        }
    }
}

/// Final state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PermanentFailure { kind: FailureKind, reason: String },
    Cancelled,
}

impl Outcome {
    pub fn from_error(err: &FreightError) -> Self {
        if err.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::PermanentFailure {
                kind: err.failure_kind(),
                reason: err.to_string(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::PermanentFailure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Produced exactly once per dispatched file
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub dest_key: String,
    pub source: String,
    pub size_class: SizeClass,
    pub bytes_transferred: u64,
    pub checksum: Option<String>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Transient failures absorbed or exhausted by the retry policy
    pub retry_count: u32,
    pub attempts: u32,
    pub outcome: Outcome,
}

impl TransferResult {
    /// Result for a file that was never started
    pub fn cancelled(file: &FileDescriptor, size_class: SizeClass) -> Self {
        Self {
            dest_key: file.dest_key().to_string(),
            source: file.source().display_name(),
            size_class,
            bytes_transferred: 0,
            checksum: None,
            elapsed: Duration::ZERO,
            retry_count: 0,
            attempts: 0,
            outcome: Outcome::Cancelled,
        }
    }
}

/// Aggregate outcome of a scheduler run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub results: Vec<TransferResult>,
    pub cancelled: bool,
    pub chunk_plan: ChunkPlan,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub bytes_total: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| r.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            bytes_transferred: 0,
            retries: 0,
            failures: Vec::new(),
        };
        for result in &self.results {
            summary.retries += u64::from(result.retry_count);
            match &result.outcome {
                Outcome::Success => {
                    summary.succeeded += 1;
                    summary.bytes_transferred += result.bytes_transferred;
                }
                Outcome::PermanentFailure { reason, .. } => {
                    summary.failed += 1;
                    summary
                        .failures
                        .push((result.dest_key.clone(), reason.clone()));
                }
                Outcome::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Process exit code: success only when every file succeeded
    pub fn exit_code(&self) -> i32 {
        if !self.cancelled && self.results.iter().all(|r| r.outcome.is_success()) {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }
}

/// Counts for reporting "N succeeded, M failed"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    pub retries: u64,
    /// Destination key and reason for every permanent failure
    pub failures: Vec<(String, String)>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
