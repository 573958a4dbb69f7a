/*!
 * Source reader: yields a file's bytes in chunk windows, in offset order
 *
 * Files above the memory-mapping threshold are mapped and sliced; smaller
 * files go through a buffered reader with one reusable chunk buffer. Peak
 * memory stays at one chunk either way.
 */

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::trace;

use super::types::{FileDescriptor, SourceLocation};
use crate::error::{FreightError, Result};

/// How the source bytes are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Mapped,
    Buffered,
    Memory,
}

/// Open source, positioned at byte 0
pub enum SourceReader {
    Mapped {
        map: Mmap,
        chunk_size: usize,
        offset: usize,
    },
    Buffered {
        reader: BufReader<File>,
        buffer: Vec<u8>,
        remaining: u64,
    },
    Memory {
        data: Arc<[u8]>,
        chunk_size: usize,
        offset: usize,
    },
}

impl SourceReader {
    /// Open `file` for chunked reading
    ///
    /// Fails with [`FreightError::SourceChanged`] when the size on disk, or
    /// the length of an in-memory buffer, does not match the descriptor.
    pub fn open(file: &FileDescriptor, chunk_size: u64, mmap_threshold: u64) -> Result<Self> {
        let chunk_size = usize::try_from(chunk_size.max(1)).unwrap_or(usize::MAX);

        match file.source() {
            SourceLocation::Memory { data, .. } => {
                let actual = data.len() as u64;
                if actual != file.size() {
                    return Err(FreightError::SourceChanged {
                        key: file.dest_key().to_string(),
                        expected: file.size(),
                        actual,
                    });
                }
                Ok(SourceReader::Memory {
                    data: Arc::clone(data),
                    chunk_size,
                    offset: 0,
                })
            }
            SourceLocation::Path(path) => {
                let handle = File::open(path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        FreightError::SourceNotFound(path.clone())
                    } else {
                        FreightError::Io(e)
                    }
                })?;

                let actual = handle.metadata()?.len();
                if actual != file.size() {
                    return Err(FreightError::SourceChanged {
                        key: file.dest_key().to_string(),
                        expected: file.size(),
                        actual,
                    });
                }

                if actual > mmap_threshold {
                    trace!(path = %path.display(), size = actual, "Mapping source");
                    // Safety: the mapping is read-only and dropped before the
                    // worker reports the file as done
                    let map = unsafe { Mmap::map(&handle)? };
                    Ok(SourceReader::Mapped {
                        map,
                        chunk_size,
                        offset: 0,
                    })
                } else {
                    let capacity = chunk_size.min(actual as usize);
                    Ok(SourceReader::Buffered {
                        reader: BufReader::with_capacity(capacity.max(1), handle),
                        buffer: vec![0u8; capacity],
                        remaining: actual,
                    })
                }
            }
        }
    }

    pub fn strategy(&self) -> ReadStrategy {
        match self {
            SourceReader::Mapped { .. } => ReadStrategy::Mapped,
            SourceReader::Buffered { .. } => ReadStrategy::Buffered,
            SourceReader::Memory { .. } => ReadStrategy::Memory,
        }
    }

    /// Next chunk window, or None at end of file
    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        match self {
            SourceReader::Mapped {
                map,
                chunk_size,
                offset,
            } => Ok(next_window(&map[..], *chunk_size, offset)),
            SourceReader::Memory {
                data,
                chunk_size,
                offset,
            } => Ok(next_window(&data[..], *chunk_size, offset)),
            SourceReader::Buffered {
                reader,
                buffer,
                remaining,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let len = buffer.len().min(*remaining as usize);
                reader.read_exact(&mut buffer[..len])?;
                *remaining -= len as u64;
                Ok(Some(&buffer[..len]))
            }
        }
    }
}

fn next_window<'a>(data: &'a [u8], chunk_size: usize, offset: &mut usize) -> Option<&'a [u8]> {
    if *offset >= data.len() {
        return None;
    }
    let start = *offset;
    let end = start.saturating_add(chunk_size).min(data.len());
    *offset = end;
    Some(&data[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(data: &[u8]) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(data).unwrap();
        temp.flush().unwrap();
        temp
    }

    fn drain(reader: &mut SourceReader) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            chunks.push(chunk.to_vec());
        }
        chunks
    }

    #[test]
    fn test_buffered_read_in_windows() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let temp = temp_file(&data);
        let desc = FileDescriptor::from_path(temp.path(), "f").unwrap();

        let mut reader = SourceReader::open(&desc, 300, u64::MAX).unwrap();
        assert_eq!(reader.strategy(), ReadStrategy::Buffered);

        let chunks = drain(&mut reader);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![300, 300, 300, 100]
        );
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_mapped_above_threshold() {
        let data = vec![42u8; 4096];
        let temp = temp_file(&data);
        let desc = FileDescriptor::from_path(temp.path(), "f").unwrap();

        let mut reader = SourceReader::open(&desc, 1024, 1000).unwrap();
        assert_eq!(reader.strategy(), ReadStrategy::Mapped);
        let chunks = drain(&mut reader);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let temp = temp_file(&[1u8; 1000]);
        let desc = FileDescriptor::from_path(temp.path(), "f").unwrap();
        let reader = SourceReader::open(&desc, 1024, 1000).unwrap();
        assert_eq!(reader.strategy(), ReadStrategy::Buffered);
    }

    #[test]
    fn test_memory_source() {
        let desc = FileDescriptor::in_memory("m", b"abcdefg".to_vec(), "m");
        let mut reader = SourceReader::open(&desc, 3, 0).unwrap();
        assert_eq!(reader.strategy(), ReadStrategy::Memory);
        assert_eq!(
            drain(&mut reader),
            vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]
        );
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let temp = temp_file(b"");
        let desc = FileDescriptor::from_path(temp.path(), "empty").unwrap();
        let mut reader = SourceReader::open(&desc, 1024, 0).unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_size_change_detected() {
        let mut temp = temp_file(b"short");
        let desc = FileDescriptor::from_path(temp.path(), "grew").unwrap();
        temp.write_all(b" and longer").unwrap();
        temp.flush().unwrap();

        let err = SourceReader::open(&desc, 1024, u64::MAX).err().unwrap();
        assert!(matches!(
            err,
            FreightError::SourceChanged {
                expected: 5,
                actual: 16,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_memory_size_mismatch_rejected() {
        let desc = FileDescriptor::new(
            SourceLocation::Memory {
                name: "short".to_string(),
                data: Arc::from(&b"hello"[..]),
            },
            10,
            "short",
        );

        let err = SourceReader::open(&desc, 1024, u64::MAX).err().unwrap();
        assert!(matches!(
            err,
            FreightError::SourceChanged {
                expected: 10,
                actual: 5,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_missing_source() {
        let desc = FileDescriptor::new(
            SourceLocation::Path("/no/such/freight/file".into()),
            10,
            "gone",
        );
        let err = SourceReader::open(&desc, 1024, 0).err().unwrap();
        assert!(matches!(err, FreightError::SourceNotFound(_)));
    }
}
