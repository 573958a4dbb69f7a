//! Bundle sink: every entry lands in one shared output file.
//!
//! Workers spool their entry to a private temporary file. Finishing hashes
//! the spool; only a committed spool is appended to the bundle, and only the
//! append and the matching index update happen under the bundle lock. An
//! entry that fails verification never reaches the bundle or its index.
//! `finalize` writes the index as JSON beside the bundle.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{check_writable, DestinationSink, EntryReceipt, OffsetTracker, SinkEntry};
use crate::config::ChecksumAlgorithm;
use crate::core::checksum::{digest_reader, StreamingHasher};
use crate::core::types::FileDescriptor;
use crate::error::{FreightError, Result};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Location of one entry inside the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIndexEntry {
    pub key: String,
    pub offset: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Index written next to the bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub created_at: DateTime<Utc>,
    pub bundle: PathBuf,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<ChecksumAlgorithm>,
    pub entries: Vec<BundleIndexEntry>,
}

impl BundleIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn entry(&self, key: &str) -> Option<&BundleIndexEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

#[derive(Debug)]
struct BundleState {
    file: File,
    end: u64,
    entries: Vec<BundleIndexEntry>,
    algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct BundleSink {
    path: PathBuf,
    spool_dir: PathBuf,
    state: Arc<Mutex<BundleState>>,
}

impl BundleSink {
    /// Create (or truncate) the bundle at `path`
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let spool_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&spool_dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            spool_dir,
            state: Arc::new(Mutex::new(BundleState {
                file,
                end: 0,
                entries: Vec::new(),
                algorithm: None,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<bundle>.index.json`
    pub fn index_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".index.json");
        PathBuf::from(name)
    }

    /// Flush the bundle and write its index
    pub fn finalize(&self) -> Result<BundleIndex> {
        let state = lock_state(&self.state)?;
        state.file.sync_all()?;

        let index = BundleIndex {
            created_at: Utc::now(),
            bundle: self.path.clone(),
            total_bytes: state.end,
            algorithm: state.algorithm,
            entries: state.entries.clone(),
        };
        fs::write(self.index_path(), serde_json::to_string_pretty(&index)?)?;

        info!(
            bundle = %self.path.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes,
            "Bundle finalized"
        );
        Ok(index)
    }
}

fn lock_state(state: &Mutex<BundleState>) -> Result<MutexGuard<'_, BundleState>> {
    state
        .lock()
        .map_err(|_| FreightError::permanent_destination("bundle lock poisoned"))
}

impl DestinationSink for BundleSink {
    fn describe(&self) -> String {
        format!("bundle {}", self.path.display())
    }

    fn probe(&self) -> Result<()> {
        check_writable(&self.spool_dir)?;
        lock_state(&self.state)
            .map(|_| ())
            .map_err(|e| FreightError::SinkUnavailable(e.to_string()))
    }

    fn open_entry(
        &self,
        file: &FileDescriptor,
        digest: Option<ChecksumAlgorithm>,
    ) -> Result<Box<dyn SinkEntry>> {
        let spool = NamedTempFile::new_in(&self.spool_dir)?;
        Ok(Box::new(BundleEntry {
            key: file.dest_key().to_string(),
            spool: BufWriter::new(spool),
            tracker: OffsetTracker::default(),
            digest,
            sealed: None,
            state: Arc::clone(&self.state),
        }))
    }
}

struct BundleEntry {
    key: String,
    spool: BufWriter<NamedTempFile>,
    tracker: OffsetTracker,
    digest: Option<ChecksumAlgorithm>,
    /// Receipt from `finish`; the append must reproduce it
    sealed: Option<EntryReceipt>,
    state: Arc<Mutex<BundleState>>,
}

impl SinkEntry for BundleEntry {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.tracker.advance(&self.key, offset, data.len())?;
        self.spool.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<EntryReceipt> {
        self.spool.flush()?;
        let spool = self.spool.get_mut().as_file_mut();
        spool.seek(SeekFrom::Start(0))?;

        let receipt = match self.digest {
            Some(algorithm) => {
                let (bytes_written, digest) = digest_reader(&mut *spool, algorithm)?;
                EntryReceipt {
                    bytes_written,
                    digest: Some(digest),
                }
            }
            None => EntryReceipt {
                bytes_written: spool.metadata()?.len(),
                digest: None,
            },
        };
        self.sealed = Some(receipt.clone());
        Ok(receipt)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let BundleEntry {
            key,
            spool,
            digest,
            sealed,
            state: shared,
            ..
        } = *self;
        let sealed = sealed.ok_or_else(|| {
            FreightError::permanent_destination(format!("entry {} committed before finish", key))
        })?;

        let mut spool = spool.into_inner().map_err(|e| e.into_error())?;
        spool.as_file_mut().seek(SeekFrom::Start(0))?;

        let mut state = lock_state(&shared)?;
        let start = state.end;
        let appended = append_spool(&mut state.file, start, spool.as_file_mut(), digest)
            .and_then(|appended| matches_receipt(appended, &sealed));

        let (size, digest_hex) = match appended {
            Ok(result) => result,
            Err(e) => {
                // Drop the partial append so the next entry starts clean
                state.file.set_len(start)?;
                return Err(e);
            }
        };

        state.end = start + size;
        if digest.is_some() {
            state.algorithm = digest;
        }
        let entry = BundleIndexEntry {
            key: key.clone(),
            offset: start,
            size,
            digest: digest_hex,
        };
        // A rewritten key replaces its earlier index entry
        match state.entries.iter().position(|existing| existing.key == key) {
            Some(pos) => state.entries[pos] = entry,
            None => state.entries.push(entry),
        }

        debug!(key = %key, offset = start, bytes = size, "Entry appended");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        debug!(key = %self.key, "Entry aborted");
    }
}

/// The append must carry exactly the bytes that were verified
fn matches_receipt(
    appended: (u64, Option<String>),
    sealed: &EntryReceipt,
) -> Result<(u64, Option<String>)> {
    let (size, digest) = appended;
    if size != sealed.bytes_written {
        return Err(FreightError::SizeMismatch {
            expected: sealed.bytes_written,
            actual: size,
        });
    }
    if digest != sealed.digest {
        return Err(FreightError::ChecksumMismatch {
            expected: sealed.digest.clone().unwrap_or_default(),
            actual: digest.unwrap_or_default(),
        });
    }
    Ok((size, digest))
}

/// Copy the spool to the end of the bundle, hashing what is written
fn append_spool(
    bundle: &mut File,
    start: u64,
    spool: &mut File,
    digest: Option<ChecksumAlgorithm>,
) -> Result<(u64, Option<String>)> {
    bundle.seek(SeekFrom::Start(start))?;
    let mut hasher = digest.map(StreamingHasher::new);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = spool.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        bundle.write_all(&buffer[..n])?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..n]);
        }
        size += n as u64;
    }
    bundle.flush()?;

    Ok((size, hasher.map(StreamingHasher::finalize_hex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum::digest_bytes;
    use tempfile::tempdir;

    fn write_entry(sink: &BundleSink, key: &str, data: &[u8]) -> EntryReceipt {
        let desc = FileDescriptor::in_memory(key, data.to_vec(), key);
        let mut entry = sink.open_entry(&desc, Some(ChecksumAlgorithm::Sha256)).unwrap();
        let mut offset = 0;
        for chunk in data.chunks(4) {
            entry.write_chunk(offset, chunk).unwrap();
            offset += chunk.len() as u64;
        }
        let receipt = entry.finish().unwrap();
        entry.commit().unwrap();
        receipt
    }

    #[test]
    fn test_entries_concatenate_with_index() {
        let dir = tempdir().unwrap();
        let sink = BundleSink::create(dir.path().join("out.bundle")).unwrap();
        sink.probe().unwrap();

        let first = write_entry(&sink, "a.txt", b"first entry");
        let second = write_entry(&sink, "b/c.txt", b"second");
        assert_eq!(first.bytes_written, 11);
        assert_eq!(
            second.digest.unwrap(),
            digest_bytes(b"second", ChecksumAlgorithm::Sha256)
        );

        let index = sink.finalize().unwrap();
        assert_eq!(index.total_bytes, 17);
        assert_eq!(index.algorithm, Some(ChecksumAlgorithm::Sha256));

        let bundle = fs::read(sink.path()).unwrap();
        let b = index.entry("b/c.txt").unwrap();
        assert_eq!(&bundle[b.offset as usize..(b.offset + b.size) as usize], b"second");

        let loaded = BundleIndex::load(&sink.index_path()).unwrap();
        assert_eq!(loaded.entries, index.entries);
    }

    #[test]
    fn test_aborted_entry_not_indexed() {
        let dir = tempdir().unwrap();
        let sink = BundleSink::create(dir.path().join("out.bundle")).unwrap();

        let desc = FileDescriptor::in_memory("x", b"xyz".to_vec(), "x");
        let mut entry = sink.open_entry(&desc, None).unwrap();
        entry.write_chunk(0, b"xyz").unwrap();
        entry.abort();

        let index = sink.finalize().unwrap();
        assert!(index.entries.is_empty());
        assert_eq!(fs::metadata(sink.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_finished_entry_stays_out_until_commit() {
        let dir = tempdir().unwrap();
        let sink = BundleSink::create(dir.path().join("out.bundle")).unwrap();

        let desc = FileDescriptor::in_memory("r", b"rejected".to_vec(), "r");
        let mut entry = sink.open_entry(&desc, Some(ChecksumAlgorithm::Blake3)).unwrap();
        entry.write_chunk(0, b"rejected").unwrap();
        let receipt = entry.finish().unwrap();
        assert_eq!(receipt.bytes_written, 8);
        assert_eq!(
            receipt.digest.unwrap(),
            digest_bytes(b"rejected", ChecksumAlgorithm::Blake3)
        );
        entry.abort();

        write_entry(&sink, "kept", b"kept");
        let index = sink.finalize().unwrap();
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].key, "kept");
        assert_eq!(index.entries[0].offset, 0);
        assert_eq!(fs::read(sink.path()).unwrap(), b"kept");
    }

    #[test]
    fn test_rewritten_key_replaces_index_entry() {
        let dir = tempdir().unwrap();
        let sink = BundleSink::create(dir.path().join("out.bundle")).unwrap();

        write_entry(&sink, "k", b"old");
        write_entry(&sink, "k", b"newer");
        let index = sink.finalize().unwrap();

        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].offset, 3);
        assert_eq!(index.entries[0].size, 5);
    }

    #[test]
    fn test_index_path() {
        let dir = tempdir().unwrap();
        let sink = BundleSink::create(dir.path().join("run.bundle")).unwrap();
        assert_eq!(sink.index_path(), dir.path().join("run.bundle.index.json"));
    }
}
