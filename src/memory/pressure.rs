//! Pressure-driven GC cadence (spec.md §4.1, `configure_gc`):
//! tracks bytes in use against a configured budget and derives the
//! sweep interval the lifecycle allocator's autoclean loop should use.
//!
//! Grounded on `memory/allocator/pressure_manager.rs::MemoryPressureManager`,
//! narrowed from its callback/event-history machinery down to the level
//! classification and interval calculation this crate's autoclean loop
//! needs.

use super::common::*;
use crate::config::GcConfig;
use parking_lot::RwLock;

pub struct PressureManager {
    budget_bytes: AtomicU64,
    used_bytes: AtomicU64,
    config: RwLock<GcConfig>,
}

impl PressureManager {
    pub fn new(budget_bytes: u64, config: GcConfig) -> Self {
        Self {
            budget_bytes: AtomicU64::new(budget_bytes.max(1)),
            used_bytes: AtomicU64::new(0),
            config: RwLock::new(config),
        }
    }

    pub fn record_alloc(&self, size: u64) {
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_free(&self, size: u64) {
        self.used_bytes.fetch_sub(size.min(self.used_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
    }

    fn usage_ratio(&self) -> f64 {
        let used = self.used_bytes.load(Ordering::Relaxed) as f64;
        let total = self.budget_bytes.load(Ordering::Relaxed) as f64;
        used / total
    }

    pub fn level(&self) -> PressureLevel {
        let ratio = self.usage_ratio();
        if ratio >= 0.95 {
            PressureLevel::Emergency
        } else if ratio >= 0.90 {
            PressureLevel::Critical
        } else if ratio >= 0.80 {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Sweep interval for the current pressure level, interpolated
    /// between the configured min/max (spec.md §4.1, `configure_gc`):
    /// busier = shorter interval. Once cumulative garbage pressure
    /// exceeds `pressure_threshold_bytes`, the sweeper backs down to
    /// `min_interval_ns` regardless of the ratio-based level.
    pub fn sweep_interval_ns(&self) -> u64 {
        let cfg = self.config.read();
        if self.used_bytes.load(Ordering::Relaxed) >= cfg.pressure_threshold_bytes {
            return cfg.min_interval_ns;
        }
        match self.level() {
            PressureLevel::Emergency => cfg.min_interval_ns,
            PressureLevel::Critical => cfg.min_interval_ns * 4,
            PressureLevel::Warning => (cfg.min_interval_ns + cfg.max_interval_ns) / 2,
            PressureLevel::Normal => cfg.max_interval_ns,
        }
    }

    pub fn reconfigure(&self, config: GcConfig) {
        *self.config.write() = config;
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_climbs_with_usage() {
        let mgr = PressureManager::new(1000, GcConfig::default());
        assert_eq!(mgr.level(), PressureLevel::Normal);
        mgr.record_alloc(850);
        assert_eq!(mgr.level(), PressureLevel::Warning);
        mgr.record_alloc(100);
        assert_eq!(mgr.level(), PressureLevel::Critical);
    }

    #[test]
    fn sweep_interval_shrinks_under_pressure() {
        let mgr = PressureManager::new(1000, GcConfig::default());
        let calm = mgr.sweep_interval_ns();
        mgr.record_alloc(960);
        let busy = mgr.sweep_interval_ns();
        assert!(busy < calm);
    }

    #[test]
    fn free_never_underflows() {
        let mgr = PressureManager::new(1000, GcConfig::default());
        mgr.record_free(500);
        assert_eq!(mgr.used_bytes(), 0);
    }

    #[test]
    fn pressure_threshold_forces_min_interval_even_at_low_ratio() {
        let mut cfg = GcConfig::default();
        cfg.pressure_threshold_bytes = 500;
        // budget large enough that the 80/90/95% ratio thresholds never
        // trip, so only the explicit byte threshold should matter.
        let mgr = PressureManager::new(1_000_000, cfg);
        mgr.record_alloc(600);
        assert_eq!(mgr.level(), PressureLevel::Normal);
        assert_eq!(mgr.sweep_interval_ns(), cfg.min_interval_ns);
    }
}
