//! In-memory sink. Entries buffer privately and become visible on commit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DestinationSink, EntryReceipt, OffsetTracker, SinkEntry};
use crate::config::ChecksumAlgorithm;
use crate::core::checksum::digest_bytes;
use crate::core::types::FileDescriptor;
use crate::error::{FreightError, Result};

type Entries = BTreeMap<String, Vec<u8>>;

/// Cloneable handle; clones share the same committed entries
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Entries>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        lock_entries(&self.entries)
    }

    /// Committed bytes for `key`
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_entries(entries: &Mutex<Entries>) -> Result<MutexGuard<'_, Entries>> {
    entries
        .lock()
        .map_err(|_| FreightError::permanent_destination("memory sink lock poisoned"))
}

impl DestinationSink for MemorySink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn probe(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn open_entry(
        &self,
        file: &FileDescriptor,
        digest: Option<ChecksumAlgorithm>,
    ) -> Result<Box<dyn SinkEntry>> {
        Ok(Box::new(MemoryEntry {
            key: file.dest_key().to_string(),
            buffer: Vec::new(),
            tracker: OffsetTracker::default(),
            digest,
            entries: Arc::clone(&self.entries),
        }))
    }
}

struct MemoryEntry {
    key: String,
    buffer: Vec<u8>,
    tracker: OffsetTracker,
    digest: Option<ChecksumAlgorithm>,
    entries: Arc<Mutex<Entries>>,
}

impl SinkEntry for MemoryEntry {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.tracker.advance(&self.key, offset, data.len())?;
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<EntryReceipt> {
        Ok(EntryReceipt {
            bytes_written: self.buffer.len() as u64,
            digest: self
                .digest
                .map(|algorithm| digest_bytes(&self.buffer, algorithm)),
        })
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryEntry {
            key,
            buffer,
            entries,
            ..
        } = *self;
        lock_entries(&entries)?.insert(key, buffer);
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
