//! Directory sink: mirrors destination keys under a root directory.
//!
//! Each entry is written to its own temporary file beside the final path
//! and renamed into place on commit. A failed, unverified or aborted attempt
//! never touches whatever already sits under the real name.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{check_writable, DestinationSink, EntryReceipt, OffsetTracker, SinkEntry};
use crate::config::ChecksumAlgorithm;
use crate::core::checksum::digest_file;
use crate::core::types::FileDescriptor;
use crate::error::{FreightError, Result};

#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a destination key to a path under the root
    ///
    /// Keys use `/` separators. Absolute keys and keys leaving the root are
    /// rejected.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let mut path = self.root.clone();
        let mut parts = 0;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    parts += 1;
                }
                Component::CurDir => {}
                _ => return Err(FreightError::InvalidDestination(key.to_string())),
            }
        }

        if parts == 0 {
            return Err(FreightError::InvalidDestination(key.to_string()));
        }
        Ok(path)
    }
}

impl DestinationSink for DirectorySink {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn probe(&self) -> Result<()> {
        check_writable(&self.root)
    }

    fn open_entry(
        &self,
        file: &FileDescriptor,
        digest: Option<ChecksumAlgorithm>,
    ) -> Result<Box<dyn SinkEntry>> {
        let target = self.resolve(file.dest_key())?;
        let parent = target
            .parent()
            .ok_or_else(|| FreightError::InvalidDestination(file.dest_key().to_string()))?;
        fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        Ok(Box::new(DirectoryEntry {
            key: file.dest_key().to_string(),
            target,
            writer: BufWriter::new(temp),
            tracker: OffsetTracker::default(),
            digest,
        }))
    }
}

struct DirectoryEntry {
    key: String,
    target: PathBuf,
    writer: BufWriter<NamedTempFile>,
    tracker: OffsetTracker,
    digest: Option<ChecksumAlgorithm>,
}

impl SinkEntry for DirectoryEntry {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.tracker.advance(&self.key, offset, data.len())?;
        self.writer.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<EntryReceipt> {
        self.writer.flush()?;
        let temp = self.writer.get_ref();
        temp.as_file().sync_all()?;

        // Read back what landed on disk
        let receipt = match self.digest {
            Some(algorithm) => {
                let (bytes_written, digest) = digest_file(temp.path(), algorithm)?;
                EntryReceipt {
                    bytes_written,
                    digest: Some(digest),
                }
            }
            None => EntryReceipt {
                bytes_written: temp.as_file().metadata()?.len(),
                digest: None,
            },
        };
        Ok(receipt)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let DirectoryEntry {
            key,
            target,
            writer,
            tracker,
            ..
        } = *self;

        let temp = writer.into_inner().map_err(|e| e.into_error())?;
        temp.persist(&target).map_err(|e| e.error)?;
        debug!(key = %key, path = %target.display(), bytes = tracker.written(), "Entry committed");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        // Dropping the temp file removes it
        debug!(key = %self.key, "Entry aborted");
    }
}
