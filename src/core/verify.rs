/*!
 * Post-transfer integrity verification
 *
 * The source digest is computed while the chunks stream through the worker,
 * so checksum verification never needs a second read of the source. The
 * destination side comes from the sink's [`EntryReceipt`] or from a reader
 * over the written data.
 */

use std::io::Read;

use tracing::debug;

use super::checksum::digest_reader;
use super::sink::EntryReceipt;
use crate::config::{ChecksumAlgorithm, TransferConfig, VerifyMode};
use crate::error::{FreightError, Result};

/// Proof that a transfer matched its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub bytes: u64,
    /// Present in checksum mode
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityVerifier {
    mode: VerifyMode,
    algorithm: ChecksumAlgorithm,
}

impl IntegrityVerifier {
    pub fn new(mode: VerifyMode, algorithm: ChecksumAlgorithm) -> Self {
        Self { mode, algorithm }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.verify_mode, config.checksum_algorithm)
    }

    pub fn mode(&self) -> VerifyMode {
        self.mode
    }

    /// Digest the worker and sink must compute, if any
    pub fn digest_algorithm(&self) -> Option<ChecksumAlgorithm> {
        match self.mode {
            VerifyMode::Size => None,
            VerifyMode::Checksum => Some(self.algorithm),
        }
    }

    /// Compare the sink's receipt against the source
    ///
    /// Mismatches are transient errors, so the retry policy re-runs the file.
    pub fn verify(
        &self,
        receipt: &EntryReceipt,
        expected_size: u64,
        expected_digest: Option<&str>,
    ) -> Result<Verified> {
        self.check(
            receipt.bytes_written,
            receipt.digest.as_deref(),
            expected_size,
            expected_digest,
        )
    }

    /// Re-read transferred data and compare it against the source
    pub fn verify_reader<R: Read>(
        &self,
        reader: R,
        expected_size: u64,
        expected_digest: Option<&str>,
    ) -> Result<Verified> {
        let (bytes, digest) = digest_reader(reader, self.algorithm)?;
        self.check(bytes, Some(&digest), expected_size, expected_digest)
    }

    fn check(
        &self,
        actual_size: u64,
        actual_digest: Option<&str>,
        expected_size: u64,
        expected_digest: Option<&str>,
    ) -> Result<Verified> {
        if actual_size != expected_size {
            return Err(FreightError::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        let digest = match (self.mode, expected_digest) {
            (VerifyMode::Size, _) | (VerifyMode::Checksum, None) => None,
            (VerifyMode::Checksum, Some(expected)) => {
                let actual = actual_digest.ok_or_else(|| {
                    FreightError::permanent_destination("destination reported no digest")
                })?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(FreightError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Some(expected.to_string())
            }
        };

        debug!(bytes = actual_size, mode = ?self.mode, "Transfer verified");
        Ok(Verified {
            bytes: actual_size,
            digest,
        })
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(VerifyMode::default(), ChecksumAlgorithm::default())
    }
}
