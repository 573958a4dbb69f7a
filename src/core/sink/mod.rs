/*!
 * Destination sinks
 *
 * A sink accepts each file as an entry: chunks arrive strictly in offset
 * order, then the entry is finished, which stages the bytes and reports what
 * was stored. Nothing is visible under the key until the worker has verified
 * that receipt and commits the entry; an entry that fails verification is
 * aborted instead. Entries are independent, so workers never contend on a
 * sink except where an implementation serializes its own commit step.
 */

use std::path::Path;

use tempfile::NamedTempFile;

use super::types::FileDescriptor;
use crate::config::ChecksumAlgorithm;
use crate::error::{FreightError, Result};

mod bundle;
mod directory;
mod memory;

pub use bundle::{BundleIndex, BundleIndexEntry, BundleSink};
pub use directory::DirectorySink;
pub use memory::MemorySink;

/// What the sink stored for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReceipt {
    pub bytes_written: u64,
    /// Digest of the stored bytes, when one was requested
    pub digest: Option<String>,
}

/// Where transferred files go
pub trait DestinationSink: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Check the destination can accept writes at all
    ///
    /// Called once before dispatch; an error here aborts the run.
    fn probe(&self) -> Result<()>;

    /// Start a new entry for `file`
    ///
    /// With `digest` set, the receipt must carry a digest of the stored data
    /// computed with that algorithm.
    fn open_entry(
        &self,
        file: &FileDescriptor,
        digest: Option<ChecksumAlgorithm>,
    ) -> Result<Box<dyn SinkEntry>>;
}

/// One file being written to a sink
pub trait SinkEntry: Send {
    /// Append `data` at `offset`; offsets must be contiguous from 0
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush the staged bytes and describe what was stored
    ///
    /// The entry stays invisible under its key until [`SinkEntry::commit`].
    fn finish(&mut self) -> Result<EntryReceipt>;

    /// Publish a finished entry under its key
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard everything written to the entry
    fn abort(self: Box<Self>);
}

/// Rejects writes that are not contiguous in offset order
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    next: u64,
}

impl OffsetTracker {
    pub(crate) fn advance(&mut self, key: &str, offset: u64, len: usize) -> Result<()> {
        if offset != self.next {
            return Err(FreightError::permanent_destination(format!(
                "out-of-order write to {}: expected offset {}, got {}",
                key, self.next, offset
            )));
        }
        self.next += len as u64;
        Ok(())
    }

    pub(crate) fn written(&self) -> u64 {
        self.next
    }
}

/// Write test in `dir`, creating it if needed
pub(crate) fn check_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        FreightError::SinkUnavailable(format!("cannot create {}: {}", dir.display(), e))
    })?;
    NamedTempFile::new_in(dir).map_err(|e| {
        FreightError::SinkUnavailable(format!("cannot write to {}: {}", dir.display(), e))
    })?;
    Ok(())
}
