//! Enumerated configuration (spec.md §6), grounded on the teacher's
//! `Config` (`src/lib.rs`) and `IoOptions` (`src/io/file_manager.rs`)
//! pattern of a plain, serde-derived settings struct with a `Default` impl.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Allocation flags (spec.md §6, `alloc.flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct AllocFlags: u32 {
        const HUGE_PAGES = 1 << 0;
        const CACHE_ALIGNED = 1 << 1;
        const STRICT_CHECK = 1 << 2;
        const LOW_PRIORITY = 1 << 3;
    }
}

/// Buddy allocator block-selection policy (spec.md §6, `buddy.priority`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuddyPriority {
    FirstFit,
    BestFit,
    WorstFit,
}

/// Shared-container access strictness (spec.md §6, `shared.level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SharedLevel {
    NoLevel = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
}

/// GC sweeper cadence shaping (spec.md §4.1, `configure_gc`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GcConfig {
    pub min_interval_ns: u64,
    pub max_interval_ns: u64,
    pub pressure_threshold_bytes: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_interval_ns: 1_000_000,       // 1ms under pressure
            max_interval_ns: 500_000_000,     // 500ms when quiescent
            pressure_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Top-level tunables for a `libttak` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtakConfig {
    pub buddy_priority: BuddyPriority,
    pub lattice_dim: usize,
    pub nice_min: i8,
    pub nice_max: i8,
    pub progress_quantum: usize,
    pub gc: GcConfig,
    pub small_alloc_limit: usize,
}

impl Default for TtakConfig {
    fn default() -> Self {
        Self {
            buddy_priority: BuddyPriority::FirstFit,
            lattice_dim: 4,
            nice_min: -5,
            nice_max: 5,
            progress_quantum: 1000,
            gc: GcConfig::default(),
            small_alloc_limit: 256,
        }
    }
}

impl TtakConfig {
    /// Clamp a requested nice value into the configured range (spec.md §6).
    pub fn clamp_nice(&self, nice: i8) -> i8 {
        nice.clamp(self.nice_min, self.nice_max)
    }
}
