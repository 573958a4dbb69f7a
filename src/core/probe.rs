/*!
 * Memory probe feeding the chunk sizer
 *
 * The chunk sizer is a pure function of the numbers reported here. Probing is
 * behind a trait so runs can be planned against a fixed memory figure.
 */

use sysinfo::System;
use tracing::debug;

/// Memory figures in bytes at the moment a run is planned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub available: u64,
    /// 0 when the platform does not report a total
    pub total: u64,
}

impl MemorySnapshot {
    pub fn new(available: u64, total: u64) -> Self {
        Self { available, total }
    }
}

/// Source of memory figures
pub trait MemoryProbe: Send + Sync {
    /// None when available memory cannot be determined
    fn snapshot(&self) -> Option<MemorySnapshot>;
}

/// Reads live figures from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl SystemMemory {
    pub fn detect() -> Option<MemorySnapshot> {
        let mut sys = System::new();
        sys.refresh_memory();

        let available = sys.available_memory();
        let total = sys.total_memory();
        debug!(available, total, "Probed system memory");

        // sysinfo reports 0 on platforms it cannot read
        if available == 0 {
            None
        } else {
            Some(MemorySnapshot::new(available, total))
        }
    }
}

impl MemoryProbe for SystemMemory {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        Self::detect()
    }
}

/// Fixed figures, or none at all
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<MemorySnapshot>);

impl FixedMemory {
    pub fn available(bytes: u64) -> Self {
        FixedMemory(Some(MemorySnapshot::new(bytes, 0)))
    }

    pub fn unknown() -> Self {
        FixedMemory(None)
    }
}

impl MemoryProbe for FixedMemory {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_memory_detect() {
        // Containers may hide the figures; either answer is valid
        if let Some(snapshot) = SystemMemory::detect() {
            assert!(snapshot.available > 0);
        }
    }

    #[test]
    fn test_fixed_memory() {
        assert_eq!(
            FixedMemory::available(1024).snapshot(),
            Some(MemorySnapshot::new(1024, 0))
        );
        assert_eq!(FixedMemory::unknown().snapshot(), None);
    }
}
