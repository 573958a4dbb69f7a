/*!
 * Error types for Freight
 *
 * Every failure is classified into one of three classes:
 * - Transient: worth retrying (timeouts, resets, integrity mismatches)
 * - Permanent: recorded against the file, the run continues
 * - Fatal: aborts the whole run before or during dispatch
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FreightError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

#[derive(Debug, Error)]
pub enum FreightError {
    /// Source file or directory not found
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Source changed size between discovery and transfer
    #[error("Source {key} changed size: expected {expected} bytes, found {actual}")]
    SourceChanged {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Destination key cannot be mapped onto the sink
    #[error("Invalid destination key: {0}")]
    InvalidDestination(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Destination digest differs from the source digest
    #[error("Checksum verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Destination byte count differs from the source byte count
    #[error("Size verification failed: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Sink rejected a write or could not finalize an entry
    #[error("Destination error: {message}")]
    Destination { message: String, transient: bool },

    /// Sink cannot be reached at all
    #[error("Destination unavailable: {0}")]
    SinkUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool could not be created
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Worker panicked while transferring a file
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// Retries exhausted; carries the last transient error
    #[error("All {attempts} attempts exhausted: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<FreightError>,
    },

    /// Run was cancelled before or during this transfer
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Failure class used by the retry policy and the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff
    Transient,
    /// Record against the file and continue the run
    Permanent,
    /// Abort the run
    Fatal,
}

/// Kind of a permanent per-file failure, surfaced in transfer results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetriesExhausted,
    SourceMissing,
    PermissionDenied,
    StorageFull,
    InvalidInput,
    Integrity,
    Destination,
    Io,
    Panic,
}

impl FreightError {
    /// Shorthand for a sink error that is worth retrying
    pub fn transient_destination(message: impl Into<String>) -> Self {
        FreightError::Destination {
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a sink error that will not go away on retry
    pub fn permanent_destination(message: impl Into<String>) -> Self {
        FreightError::Destination {
            message: message.into(),
            transient: false,
        }
    }

    /// Classify this error
    pub fn class(&self) -> FailureClass {
        match self {
            FreightError::Io(err) => {
                if Self::is_io_transient(err) {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            FreightError::ChecksumMismatch { .. } | FreightError::SizeMismatch { .. } => {
                FailureClass::Transient
            }
            FreightError::Destination { transient, .. } => {
                if *transient {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            FreightError::SinkUnavailable(_)
            | FreightError::Config(_)
            | FreightError::WorkerPool(_) => FailureClass::Fatal,
            FreightError::SourceNotFound(_)
            | FreightError::SourceChanged { .. }
            | FreightError::InvalidDestination(_)
            | FreightError::WorkerPanic(_)
            | FreightError::RetriesExhausted { .. }
            | FreightError::Cancelled => FailureClass::Permanent,
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Check if this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }

    /// Check if this error represents cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FreightError::Cancelled)
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
                | WriteZero
                | UnexpectedEof
        )
    }

    /// Kind reported in a permanent failure outcome
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FreightError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            FreightError::SourceNotFound(_) => FailureKind::SourceMissing,
            FreightError::SourceChanged { .. } | FreightError::InvalidDestination(_) => {
                FailureKind::InvalidInput
            }
            FreightError::ChecksumMismatch { .. } | FreightError::SizeMismatch { .. } => {
                FailureKind::Integrity
            }
            FreightError::Destination { .. } | FreightError::SinkUnavailable(_) => {
                FailureKind::Destination
            }
            FreightError::WorkerPanic(_) => FailureKind::Panic,
            FreightError::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => FailureKind::SourceMissing,
                io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
                io::ErrorKind::StorageFull => FailureKind::StorageFull,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                    FailureKind::InvalidInput
                }
                _ => FailureKind::Io,
            },
            FreightError::Config(_) | FreightError::WorkerPool(_) | FreightError::Cancelled => {
                FailureKind::InvalidInput
            }
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            FailureClass::Fatal => EXIT_FATAL,
            _ => match self {
                FreightError::ChecksumMismatch { .. } | FreightError::SizeMismatch { .. } => {
                    EXIT_INTEGRITY
                }
                FreightError::SourceNotFound(_) => EXIT_FATAL,
                _ => EXIT_PARTIAL,
            },
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            FreightError::SourceNotFound(_)
            | FreightError::SourceChanged { .. }
            | FreightError::InvalidDestination(_) => ErrorCategory::Validation,
            FreightError::Io(_) => ErrorCategory::IoError,
            FreightError::ChecksumMismatch { .. } | FreightError::SizeMismatch { .. } => {
                ErrorCategory::Integrity
            }
            FreightError::Destination { .. } | FreightError::SinkUnavailable(_) => {
                ErrorCategory::Destination
            }
            FreightError::Config(_) => ErrorCategory::Configuration,
            FreightError::WorkerPool(_) | FreightError::WorkerPanic(_) => {
                ErrorCategory::Concurrency
            }
            FreightError::RetriesExhausted { .. } => ErrorCategory::Retry,
            FreightError::Cancelled => ErrorCategory::Cancellation,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Source or destination key validation
    Validation,
    /// I/O operation errors
    IoError,
    /// Data integrity errors (checksums, sizes)
    Integrity,
    /// Sink errors
    Destination,
    /// Configuration errors
    Configuration,
    /// Worker pool errors
    Concurrency,
    /// Retry exhaustion
    Retry,
    /// Cooperative cancellation
    Cancellation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Destination => write!(f, "destination"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Concurrency => write!(f, "concurrency"),
            ErrorCategory::Retry => write!(f, "retry"),
            ErrorCategory::Cancellation => write!(f, "cancellation"),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::RetriesExhausted => "retries-exhausted",
            FailureKind::SourceMissing => "source-missing",
            FailureKind::PermissionDenied => "permission-denied",
            FailureKind::StorageFull => "storage-full",
            FailureKind::InvalidInput => "invalid-input",
            FailureKind::Integrity => "integrity",
            FailureKind::Destination => "destination",
            FailureKind::Io => "io",
            FailureKind::Panic => "panic",
        };
        f.write_str(name)
    }
}

impl From<serde_json::Error> for FreightError {
    fn from(err: serde_json::Error) -> Self {
        FreightError::Config(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for FreightError {
    fn from(err: toml::de::Error) -> Self {
        FreightError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for FreightError {
    fn from(err: toml::ser::Error) -> Self {
        FreightError::Config(format!("TOML serialize error: {}", err))
    }
}
