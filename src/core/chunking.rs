/*!
 * Memory-aware chunk sizing
 *
 * One chunk size is computed per run and shared read-only by every worker:
 * - usable memory = available × (1 − reserved fraction)
 * - per-stream budget = usable / concurrency
 * - rounded down to a multiple of the floor, then clamped to [floor, ceiling]
 */

use serde::Serialize;
use tracing::{info, warn};

use super::probe::{MemoryProbe, MemorySnapshot};
use crate::config::TransferConfig;

/// Smallest chunk worth a read/write round trip (64 KiB)
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Largest chunk a single stream may hold (64 MiB)
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Used when available memory cannot be determined (4 MiB)
pub const FALLBACK_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Below this share of total memory, the share itself is used as available
const LOW_MEMORY_FRACTION: u64 = 10;

/// Compute the chunk size for a run
///
/// Pure: the same inputs always give the same answer. The result is always
/// within [`MIN_CHUNK_SIZE`, `MAX_CHUNK_SIZE`] and never grows as
/// `concurrency` grows. A concurrency of 0 is treated as 1.
pub fn compute_chunk_size(available_memory: u64, concurrency: usize, reserved_fraction: f64) -> u64 {
    let reserved = if reserved_fraction.is_finite() {
        reserved_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let usable = (available_memory as f64 * (1.0 - reserved)) as u64;
    let per_stream = usable / concurrency.max(1) as u64;
    clamp_chunk_size(per_stream)
}

/// Round down to a multiple of the floor and clamp to [floor, ceiling]
pub fn clamp_chunk_size(bytes: u64) -> u64 {
    let aligned = bytes - bytes % MIN_CHUNK_SIZE;
    aligned.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// How the run's chunk size was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSizeSource {
    /// Derived from probed memory
    Computed,
    /// Taken from configuration
    Override,
    /// Memory was unknown
    Fallback,
}

impl std::fmt::Display for ChunkSizeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkSizeSource::Computed => write!(f, "computed"),
            ChunkSizeSource::Override => write!(f, "override"),
            ChunkSizeSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Chunk size for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    pub source: ChunkSizeSource,
}

impl ChunkPlan {
    pub fn new(chunk_size: u64, source: ChunkSizeSource) -> Self {
        Self { chunk_size, source }
    }

    /// Number of chunk windows for a file; 0 for an empty file
    pub fn total_chunks(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size)
    }
}

/// Chunk sizing inputs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSizer {
    concurrency: usize,
    reserved_fraction: f64,
    override_size: Option<u64>,
}

impl ChunkSizer {
    pub fn new(concurrency: usize, reserved_fraction: f64, override_size: Option<u64>) -> Self {
        Self {
            concurrency,
            reserved_fraction,
            override_size,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.concurrency,
            config.reserved_memory_fraction,
            config.chunk_size,
        )
    }

    /// Plan against figures already in hand
    pub fn plan_with(&self, memory: Option<MemorySnapshot>) -> ChunkPlan {
        if let Some(requested) = self.override_size {
            let chunk_size = clamp_chunk_size(requested);
            if chunk_size != requested {
                warn!(
                    requested,
                    chunk_size, "Configured chunk size adjusted to supported range"
                );
            }
            return ChunkPlan::new(chunk_size, ChunkSizeSource::Override);
        }

        match memory {
            Some(snapshot) => {
                let available = effective_available(snapshot);
                let chunk_size =
                    compute_chunk_size(available, self.concurrency, self.reserved_fraction);
                info!(
                    available,
                    concurrency = self.concurrency,
                    chunk_size,
                    "Computed chunk size from available memory"
                );
                ChunkPlan::new(chunk_size, ChunkSizeSource::Computed)
            }
            None => {
                warn!(
                    chunk_size = FALLBACK_CHUNK_SIZE,
                    "Available memory unknown, using fallback chunk size"
                );
                ChunkPlan::new(FALLBACK_CHUNK_SIZE, ChunkSizeSource::Fallback)
            }
        }
    }

    /// Probe memory only when no override is configured
    pub fn plan(&self, probe: &dyn MemoryProbe) -> ChunkPlan {
        if self.override_size.is_some() {
            self.plan_with(None)
        } else {
            self.plan_with(probe.snapshot())
        }
    }
}

/// Apply the low-memory guard
fn effective_available(snapshot: MemorySnapshot) -> u64 {
    let floor = snapshot.total / LOW_MEMORY_FRACTION;
    if snapshot.total > 0 && snapshot.available < floor {
        floor
    } else {
        snapshot.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::FixedMemory;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_one_gib_four_workers_hits_ceiling() {
        // (1 GiB × 0.8) / 4 ≈ 205 MiB, above the ceiling
        assert_eq!(compute_chunk_size(GIB, 4, 0.2), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_budget_within_range_is_aligned() {
        // 100 MiB × 0.8 / 4 = 20 MiB exactly
        assert_eq!(compute_chunk_size(100 * MIB, 4, 0.2), 20 * MIB);

        // 1000 KiB / 3 = 333.3 KiB, rounded down to 320 KiB
        let chunk = compute_chunk_size(1000 * 1024, 3, 0.0);
        assert_eq!(chunk, 320 * 1024);
        assert_eq!(chunk % MIN_CHUNK_SIZE, 0);
    }

    #[test]
    fn test_tiny_memory_hits_floor() {
        assert_eq!(compute_chunk_size(0, 1, 0.2), MIN_CHUNK_SIZE);
        assert_eq!(compute_chunk_size(10 * 1024, 8, 0.5), MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_zero_concurrency_treated_as_one() {
        assert_eq!(
            compute_chunk_size(32 * MIB, 0, 0.0),
            compute_chunk_size(32 * MIB, 1, 0.0)
        );
    }

    #[test]
    fn test_non_increasing_in_concurrency() {
        let mut previous = u64::MAX;
        for concurrency in 1..=64 {
            let chunk = compute_chunk_size(3 * GIB / 2, concurrency, 0.2);
            assert!(chunk <= previous);
            previous = chunk;
        }
    }

    #[test]
    fn test_override_is_clamped() {
        let sizer = ChunkSizer::new(4, 0.2, Some(1));
        let plan = sizer.plan_with(None);
        assert_eq!(plan, ChunkPlan::new(MIN_CHUNK_SIZE, ChunkSizeSource::Override));

        let sizer = ChunkSizer::new(4, 0.2, Some(GIB));
        assert_eq!(sizer.plan_with(None).chunk_size, MAX_CHUNK_SIZE);

        let sizer = ChunkSizer::new(4, 0.2, Some(2 * MIB));
        let plan = sizer.plan(&FixedMemory::available(GIB));
        assert_eq!(plan.chunk_size, 2 * MIB);
        assert_eq!(plan.source, ChunkSizeSource::Override);
    }

    #[test]
    fn test_unknown_memory_falls_back() {
        let sizer = ChunkSizer::new(4, 0.2, None);
        let plan = sizer.plan(&FixedMemory::unknown());
        assert_eq!(plan, ChunkPlan::new(FALLBACK_CHUNK_SIZE, ChunkSizeSource::Fallback));
    }

    #[test]
    fn test_low_memory_guard() {
        // 100 MiB available of 8 GiB total: 10% of total is used instead
        let snapshot = MemorySnapshot::new(100 * MIB, 8 * GIB);
        assert_eq!(effective_available(snapshot), 8 * GIB / 10);

        let snapshot = MemorySnapshot::new(4 * GIB, 8 * GIB);
        assert_eq!(effective_available(snapshot), 4 * GIB);

        let snapshot = MemorySnapshot::new(100 * MIB, 0);
        assert_eq!(effective_available(snapshot), 100 * MIB);
    }

    #[test]
    fn test_total_chunks() {
        let plan = ChunkPlan::new(MIN_CHUNK_SIZE, ChunkSizeSource::Computed);
        assert_eq!(plan.total_chunks(0), 0);
        assert_eq!(plan.total_chunks(1), 1);
        assert_eq!(plan.total_chunks(MIN_CHUNK_SIZE), 1);
        assert_eq!(plan.total_chunks(MIN_CHUNK_SIZE + 1), 2);
    }

    #[test]
    fn test_from_config() {
        let config = TransferConfig {
            concurrency: 2,
            chunk_size: Some(MIB),
            ..Default::default()
        };
        let plan = ChunkSizer::from_config(&config).plan_with(None);
        assert_eq!(plan.chunk_size, MIB);
    }
}
