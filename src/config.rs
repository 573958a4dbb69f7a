/*!
 * Configuration types for Freight
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FreightError, Result};

const MIB: u64 = 1024 * 1024;

/// Main configuration for a transfer run
///
/// Every option the engine consumes lives here. The structure is validated
/// once with [`TransferConfig::validate`] when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Number of workers in the small-file pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Files strictly larger than this go to the sequential lane
    #[serde(default = "default_large_threshold")]
    pub large_threshold_bytes: u64,

    /// Explicit chunk size in bytes (None = derive from available memory)
    #[serde(default)]
    pub chunk_size: Option<u64>,

    /// Total attempts per file, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to backoff delays
    #[serde(default)]
    pub backoff_jitter: bool,

    /// Fraction of available memory kept for the rest of the system
    #[serde(default = "default_reserved_memory_fraction")]
    pub reserved_memory_fraction: f64,

    /// Files strictly larger than this are read through a memory map
    #[serde(default = "default_mmap_threshold")]
    pub mmap_threshold_bytes: u64,

    /// How transfers are verified after the last chunk
    #[serde(default)]
    pub verify_mode: VerifyMode,

    /// Digest used when `verify_mode` is `checksum`
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Dispatch smallest files first so failures surface early
    #[serde(default = "default_true")]
    pub sort_by_size: bool,

    /// Show progress bar (CLI only)
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            large_threshold_bytes: default_large_threshold(),
            chunk_size: None,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_jitter: false,
            reserved_memory_fraction: default_reserved_memory_fraction(),
            mmap_threshold_bytes: default_mmap_threshold(),
            verify_mode: VerifyMode::Checksum,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            sort_by_size: true,
            show_progress: true,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Verification strategy applied after a file's last chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Destination byte count must equal source byte count
    Size,

    /// Destination digest must equal the digest of the source chunks
    #[default]
    Checksum,
}

/// Streaming digest algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Blake3,
    /// Artifact repositories commonly index MD5
    Md5,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    3
}

fn default_large_threshold() -> u64 {
    100 * MIB
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_reserved_memory_fraction() -> f64 {
    0.2
}

fn default_mmap_threshold() -> u64 {
    10 * MIB
}

impl TransferConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(FreightError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == Some(0) {
            return Err(FreightError::Config(
                "chunk size must be positive".to_string(),
            ));
        }
        if self.max_attempts < 1 {
            return Err(FreightError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(FreightError::Config(format!(
                "max_delay_ms ({}) is smaller than base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !self.reserved_memory_fraction.is_finite()
            || !(0.0..1.0).contains(&self.reserved_memory_fraction)
        {
            return Err(FreightError::Config(format!(
                "reserved_memory_fraction must be in [0, 1), got {}",
                self.reserved_memory_fraction
            )));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TransferConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Settings for pushing files to an artifact repository
    pub fn upload_preset() -> Self {
        Self {
            concurrency: 3,
            large_threshold_bytes: 100 * MIB,
            verify_mode: VerifyMode::Checksum,
            checksum_algorithm: ChecksumAlgorithm::Md5,
            ..Default::default()
        }
    }

    /// Settings for packing a directory into a local bundle
    pub fn archive_preset() -> Self {
        Self {
            concurrency: get_cpu_count(),
            large_threshold_bytes: 1024 * MIB,
            verify_mode: VerifyMode::Size,
            ..Default::default()
        }
    }
}

/// Get the number of available CPU cores
fn get_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.large_threshold_bytes, 100 * MIB);
        assert_eq!(config.mmap_threshold_bytes, 10 * MIB);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.chunk_size, None);
        assert_eq!(config.verify_mode, VerifyMode::Checksum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = TransferConfig {
            concurrency: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = TransferConfig {
            chunk_size: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_reserved_fraction() {
        for fraction in [1.0, -0.1, f64::NAN, 2.5] {
            let config = TransferConfig {
                reserved_memory_fraction: fraction,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{} accepted", fraction);
        }
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_inverted_delays() {
        let config = TransferConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TransferConfig {
            base_delay_ms: 5000,
            max_delay_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let upload = TransferConfig::upload_preset();
        assert_eq!(upload.checksum_algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(upload.large_threshold_bytes, 100 * MIB);
        assert!(upload.validate().is_ok());

        let archive = TransferConfig::archive_preset();
        assert_eq!(archive.large_threshold_bytes, 1024 * MIB);
        assert_eq!(archive.verify_mode, VerifyMode::Size);
        assert!(archive.concurrency >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
concurrency = 8
chunk_size = 2097152
verify_mode = "size"
checksum_algorithm = "blake3"
"#;
        let config: TransferConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.chunk_size, Some(2 * MIB));
        assert_eq!(config.verify_mode, VerifyMode::Size);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Blake3);
        assert_eq!(config.max_attempts, 3);
        assert!((config.reserved_memory_fraction - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("freight.toml");
        let config = TransferConfig {
            concurrency: 6,
            backoff_jitter: true,
            ..TransferConfig::upload_preset()
        };
        config.to_file(&path).unwrap();
        let loaded = TransferConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
