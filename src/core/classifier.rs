//! Size classifier: decides which lane a file runs in.
//!
//! Small files share the parallel pool; large files go to the sequential
//! lane, one at a time. The threshold is an inclusive upper bound for Small,
//! so a file of exactly `threshold` bytes is Small.

use super::types::{FileDescriptor, SizeClass};

/// Router that assigns a [`SizeClass`] from a file's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassifier {
    threshold: u64,
}

impl SizeClassifier {
    /// # Example
    ///
    /// ```
    /// use freight::core::classifier::SizeClassifier;
    /// use freight::core::types::SizeClass;
    ///
    /// let classifier = SizeClassifier::new(100);
    /// assert_eq!(classifier.route(100), SizeClass::Small);
    /// assert_eq!(classifier.route(101), SizeClass::Large);
    /// ```
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn route(&self, file_size: u64) -> SizeClass {
        if file_size <= self.threshold {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Partition files into (small, large), preserving input order in each
    pub fn classify(&self, files: Vec<FileDescriptor>) -> (Vec<FileDescriptor>, Vec<FileDescriptor>) {
        files
            .into_iter()
            .partition(|file| self.route(file.size()) == SizeClass::Small)
    }
}

/// Partition files into (small, large) against `threshold`
pub fn classify(
    files: Vec<FileDescriptor>,
    threshold: u64,
) -> (Vec<FileDescriptor>, Vec<FileDescriptor>) {
    SizeClassifier::new(threshold).classify(files)
}
