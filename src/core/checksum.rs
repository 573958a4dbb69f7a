/*!
 * Streaming checksum calculation, fed chunk by chunk during the transfer
 */

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::config::ChecksumAlgorithm;
use crate::error::Result;

/// Read buffer for standalone digests (64 KiB)
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Streaming hasher that calculates a digest incrementally
pub enum StreamingHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
    Md5(Md5),
}

impl StreamingHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
            ChecksumAlgorithm::Md5 => StreamingHasher::Md5(Md5::new()),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            StreamingHasher::Sha256(_) => ChecksumAlgorithm::Sha256,
            StreamingHasher::Blake3(_) => ChecksumAlgorithm::Blake3,
            StreamingHasher::Md5(_) => ChecksumAlgorithm::Md5,
        }
    }

    /// Update the hash with new data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingHasher::Sha256(hasher) => hasher.update(data),
            StreamingHasher::Blake3(hasher) => {
                hasher.update(data);
            }
            StreamingHasher::Md5(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            StreamingHasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
            StreamingHasher::Md5(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new(ChecksumAlgorithm::default())
    }
}

/// Digest everything `reader` yields
pub fn digest_reader<R: Read>(mut reader: R, algorithm: ChecksumAlgorithm) -> Result<(u64, String)> {
    let mut hasher = StreamingHasher::new(algorithm);
    let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((total, hasher.finalize_hex()))
}

/// Byte count and digest of a file on disk
pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<(u64, String)> {
    digest_reader(BufReader::new(File::open(path)?), algorithm)
}

/// Digest of an in-memory buffer
pub fn digest_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}
