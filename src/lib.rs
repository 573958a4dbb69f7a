/*!
 * Freight - resource-adaptive bulk file transfer
 *
 * Moves a batch of files into a destination while keeping memory use
 * bounded and throughput high:
 * - Chunk size derived from available memory and worker count
 * - Parallel lane for small files, one sequential lane for large files
 * - Retry with exponential backoff for transient failures
 * - Size or digest verification of every transfer (SHA-256, BLAKE3, MD5)
 * - Directory, bundle and in-memory destinations
 * - Progress events over channels, never global state
 */

pub mod cli_progress;
pub mod cli_style;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{ChecksumAlgorithm, LogLevel, TransferConfig, VerifyMode};
pub use core::{
    discover, CancellationToken, DestinationSink, FileDescriptor, Outcome, RunReport, Scheduler,
    TransferResult,
};
pub use error::{FreightError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
